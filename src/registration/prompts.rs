//! Role-keyed registration prompt templates.
//!
//! Templates carry two placeholders, `{{SESSION_ID}}` and `{{MEMBER_ID}}`.
//! When no member id is known, every line mentioning `{{MEMBER_ID}}` is
//! dropped instead of leaving an empty value behind.

use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

pub const SESSION_PLACEHOLDER: &str = "{{SESSION_ID}}";
pub const MEMBER_PLACEHOLDER: &str = "{{MEMBER_ID}}";

const ORCHESTRATOR_TEMPLATE: &str = "You are the orchestrator for this team, running in tmux session {{SESSION_ID}}.
Register yourself now by running: agentmux mark-active --session {{SESSION_ID}} --role orchestrator
Your member id is {{MEMBER_ID}}.
After registering, wait for instructions and coordinate the other team members.";

const DEVELOPER_TEMPLATE: &str = "You are a developer on this team, running in tmux session {{SESSION_ID}}.
Register yourself now by running: agentmux mark-active --session {{SESSION_ID}} --role developer
Your member id is {{MEMBER_ID}}.
After registering, wait for a task assignment before changing any code.";

const QA_TEMPLATE: &str = "You are the QA engineer on this team, running in tmux session {{SESSION_ID}}.
Register yourself now by running: agentmux mark-active --session {{SESSION_ID}} --role qa
Your member id is {{MEMBER_ID}}.
After registering, wait for features to verify.";

const TPM_TEMPLATE: &str = "You are the technical product manager on this team, running in tmux session {{SESSION_ID}}.
Register yourself now by running: agentmux mark-active --session {{SESSION_ID}} --role tpm
Your member id is {{MEMBER_ID}}.
After registering, wait for the orchestrator to share the project goals.";

const DESIGNER_TEMPLATE: &str = "You are the designer on this team, running in tmux session {{SESSION_ID}}.
Register yourself now by running: agentmux mark-active --session {{SESSION_ID}} --role designer
Your member id is {{MEMBER_ID}}.
After registering, wait for design requests.";

const GENERIC_TEMPLATE: &str = "You are the {{ROLE}} on this team, running in tmux session {{SESSION_ID}}.
Register yourself now by running: agentmux mark-active --session {{SESSION_ID}} --role {{ROLE}}
Your member id is {{MEMBER_ID}}.
After registering, wait for instructions.";

fn builtin_template(role: &str) -> String {
    match role {
        "orchestrator" => ORCHESTRATOR_TEMPLATE.to_string(),
        "developer" => DEVELOPER_TEMPLATE.to_string(),
        "qa" => QA_TEMPLATE.to_string(),
        "tpm" => TPM_TEMPLATE.to_string(),
        "designer" => DESIGNER_TEMPLATE.to_string(),
        other => GENERIC_TEMPLATE.replace("{{ROLE}}", other),
    }
}

/// Substitute placeholders in `template`.
pub fn render_template(template: &str, session: &str, member_id: Option<&str>) -> String {
    template
        .lines()
        .filter_map(|line| match (line.contains(MEMBER_PLACEHOLDER), member_id) {
            (true, None) => None,
            (true, Some(id)) => Some(line.replace(MEMBER_PLACEHOLDER, id)),
            (false, _) => Some(line.to_string()),
        })
        .map(|line| line.replace(SESSION_PLACEHOLDER, session))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Loads templates from an optional override directory, falling back to
/// the built-in text per role.
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    dir: Option<PathBuf>,
}

impl PromptLibrary {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn template(&self, role: &str) -> String {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}-prompt.md", role));
            match fs::read_to_string(&path) {
                Ok(content) => {
                    debug!(role = %role, path = %path.display(), "Using prompt template override");
                    return content;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to read prompt template"),
            }
        }
        builtin_template(role)
    }

    pub fn render(&self, role: &str, session: &str, member_id: Option<&str>) -> String {
        render_template(&self.template(role), session, member_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_both_placeholders() {
        let out = render_template("s={{SESSION_ID}}\nm={{MEMBER_ID}}", "dev-1", Some("m-7"));
        assert_eq!(out, "s=dev-1\nm=m-7");
    }

    #[test]
    fn test_render_drops_member_lines_without_id() {
        let out = PromptLibrary::default().render("developer", "dev-1", None);
        assert!(out.contains("--session dev-1 --role developer"));
        assert!(!out.contains("{{"));
        assert!(!out.contains("member id"));
    }

    #[test]
    fn test_unknown_role_uses_generic_template() {
        let out = PromptLibrary::default().render("sre", "ops-1", Some("x"));
        assert!(out.contains("--role sre"));
        assert!(out.contains("member id is x"));
    }

    #[test]
    fn test_override_directory_wins() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("qa-prompt.md"), "custom {{SESSION_ID}}").unwrap();
        let library = PromptLibrary::new(Some(dir.path().to_path_buf()));
        assert_eq!(library.render("qa", "qa-1", None), "custom qa-1");
        // roles without an override still get the built-in text
        assert!(library.render("developer", "dev-1", None).contains("developer"));
    }
}
