//! 终端文本处理工具 - 截取、分块、shell 转义

/// 截取终端快照的最后 N 行
pub fn truncate_last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= n {
        return text.to_string();
    }
    lines[lines.len() - n..].join("\n")
}

/// shell 单引号转义
pub fn shell_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EscState {
    Normal,
    /// 刚读到 ESC
    Escape,
    /// CSI: ESC [ ... 终止字节 0x40-0x7E
    Csi,
    /// OSC: ESC ] ... BEL 或 ESC \
    Osc,
    OscEscape,
}

impl EscState {
    fn advance(self, c: char) -> Self {
        match self {
            EscState::Normal => {
                if c == '\x1b' {
                    EscState::Escape
                } else {
                    EscState::Normal
                }
            }
            EscState::Escape => match c {
                '[' => EscState::Csi,
                ']' => EscState::Osc,
                _ => EscState::Normal,
            },
            EscState::Csi => {
                if ('\x40'..='\x7e').contains(&c) {
                    EscState::Normal
                } else {
                    EscState::Csi
                }
            }
            EscState::Osc => match c {
                '\x07' => EscState::Normal,
                '\x1b' => EscState::OscEscape,
                _ => EscState::Osc,
            },
            EscState::OscEscape => {
                if c == '\\' {
                    EscState::Normal
                } else {
                    EscState::Osc
                }
            }
        }
    }
}

/// 可以安全切分的字节位置（不含 0，含末尾）
///
/// 不在字符中间、不在转义序列中间、不拆开 `\r\n`。
fn safe_cut_points(text: &str) -> Vec<usize> {
    let mut points = Vec::new();
    let mut state = EscState::Normal;
    let mut prev = None;

    for (i, c) in text.char_indices() {
        if i > 0 && state == EscState::Normal && !(prev == Some('\r') && c == '\n') {
            points.push(i);
        }
        state = state.advance(c);
        prev = Some(c);
    }
    points.push(text.len());
    points
}

/// 把大段输入切成不超过 `max_bytes` 的块
///
/// 单个不可拆分单元（例如超长转义序列）超过上限时整体作为一块。
pub fn split_for_delivery(text: &str, max_bytes: usize) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_bytes {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut candidate = 0;

    for point in safe_cut_points(text) {
        if point - start <= max_bytes {
            candidate = point;
            continue;
        }
        let cut = if candidate > start { candidate } else { point };
        chunks.push(&text[start..cut]);
        start = cut;
        candidate = point;
    }

    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}
