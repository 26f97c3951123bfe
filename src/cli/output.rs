//! Output formatting for CLI commands

use serde::Serialize;

/// Pretty JSON, falling back to `{}` if serialization fails
pub fn to_json<T: Serialize>(data: &T) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string())
}

/// Print `data` as JSON when `json` is set, otherwise one line per row
pub fn print_rows<T, F>(rows: &[T], json: bool, empty: &str, line: F)
where
    T: Serialize,
    F: Fn(&T) -> String,
{
    if json {
        println!("{}", to_json(&rows));
    } else if rows.is_empty() {
        println!("{}", empty);
    } else {
        for row in rows {
            println!("  {}", line(row));
        }
    }
}

/// Single-line preview of a message for table output
pub fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_flattens_and_truncates() {
        assert_eq!(preview("a\n b", 10), "a b");
        assert_eq!(preview("abcdef", 3), "abc…");
    }
}
