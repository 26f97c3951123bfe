//! Agent runtimes that can live inside a session, and how to tell they are up.

pub mod probe;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use probe::{classify_probe, ProbeOutcome, ProbeResult, RuntimeProbe};

/// Interactive CLI agent started inside a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    #[default]
    ClaudeCode,
    GeminiCli,
    Codex,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::ClaudeCode => write!(f, "claude-code"),
            RuntimeType::GeminiCli => write!(f, "gemini-cli"),
            RuntimeType::Codex => write!(f, "codex"),
        }
    }
}

impl std::str::FromStr for RuntimeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "claude" | "claude-code" | "claudecode" => Ok(RuntimeType::ClaudeCode),
            "gemini" | "gemini-cli" | "geminicli" => Ok(RuntimeType::GeminiCli),
            "codex" => Ok(RuntimeType::Codex),
            _ => Err(anyhow!("Unknown runtime type: {}", s)),
        }
    }
}

impl RuntimeType {
    /// Command typed into the session shell to launch the runtime
    pub fn default_command(&self) -> &'static str {
        match self {
            RuntimeType::ClaudeCode => "claude --dangerously-skip-permissions",
            RuntimeType::GeminiCli => "gemini --yolo",
            RuntimeType::Codex => "codex",
        }
    }

    /// Configured override, falling back to the default
    pub fn startup_command(&self, overrides: &HashMap<String, String>) -> String {
        overrides
            .get(&self.to_string())
            .cloned()
            .unwrap_or_else(|| self.default_command().to_string())
    }

    /// Lowercase phrases that only appear once the full banner has rendered
    pub fn ready_phrases(&self) -> &'static [&'static str] {
        match self {
            RuntimeType::ClaudeCode => &["welcome to claude", "? for shortcuts", "bypass permissions on"],
            RuntimeType::GeminiCli => &["type your message", "gemini.md file"],
            RuntimeType::Codex => &["openai codex", "send a message", "▌ ask codex"],
        }
    }
}

/// Ready-banner matcher for one runtime plus configured extras
#[derive(Debug, Clone)]
pub struct ReadySignal {
    phrases: Vec<String>,
}

impl ReadySignal {
    pub fn new(runtime: RuntimeType, extra: &[String]) -> Self {
        let phrases = runtime
            .ready_phrases()
            .iter()
            .map(|p| p.to_string())
            .chain(extra.iter().map(|p| p.to_lowercase()))
            .collect();
        Self { phrases }
    }

    /// True once any ready phrase is visible. Partial startup output simply
    /// does not match; it never counts against readiness.
    pub fn matches(&self, pane: &str) -> bool {
        let lower = pane.to_lowercase();
        self.phrases.iter().any(|p| lower.contains(p.as_str()))
    }
}
