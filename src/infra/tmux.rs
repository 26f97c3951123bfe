//! tmux 管理模块 - 封装 tmux 操作
//!
//! `TmuxTransport` 是与 tmux 进程交互的最小接口，`CommandTransport`
//! 通过 `tokio::process` 调用 tmux 二进制。`TmuxManager` 在其上实现
//! 会话控制语义：字面输入、分块发送、提交键分离、捕获失败降级为空。

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::TmuxConfig;
use crate::error::{OrchestratorError, Result};
use crate::infra::terminal::split_for_delivery;

/// session 名称只允许字母、数字、`-`、`_`（tmux 的 `:` 和 `.` 有目标语义）
static SESSION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));

/// tmux list-sessions 返回的摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub attached: bool,
}

/// 会话生命周期状态，由注册状态机推进
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    RuntimeStarting,
    RuntimeReady,
    Registering,
    Registered,
    Failed,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Created => "created",
            LifecycleState::RuntimeStarting => "runtime_starting",
            LifecycleState::RuntimeReady => "runtime_ready",
            LifecycleState::Registering => "registering",
            LifecycleState::Registered => "registered",
            LifecycleState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// 一个 tmux session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub working_directory: String,
    pub lifecycle_state: LifecycleState,
    pub created_at: DateTime<Utc>,
}

/// 非字面按键
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    Enter,
    Escape,
    Interrupt,
    Backspace,
    /// 单个字符按键（例如探测字符）
    Char(char),
}

impl ControlKey {
    /// tmux send-keys 的按键名
    pub fn tmux_name(&self) -> String {
        match self {
            ControlKey::Enter => "Enter".to_string(),
            ControlKey::Escape => "Escape".to_string(),
            ControlKey::Interrupt => "C-c".to_string(),
            ControlKey::Backspace => "BSpace".to_string(),
            ControlKey::Char(c) => c.to_string(),
        }
    }
}

/// 与 tmux 交互的最小接口
#[async_trait]
pub trait TmuxTransport: Send + Sync {
    async fn new_session(&self, name: &str, working_dir: &str) -> anyhow::Result<()>;
    async fn kill_session(&self, name: &str) -> anyhow::Result<()>;
    async fn has_session(&self, name: &str) -> bool;
    async fn list_sessions(&self) -> anyhow::Result<Vec<SessionSummary>>;
    /// 字面发送文本（`send-keys -l`）
    async fn send_literal(&self, name: &str, text: &str) -> anyhow::Result<()>;
    /// 发送按键名（不带 `-l`）
    async fn send_key(&self, name: &str, key: &str) -> anyhow::Result<()>;
    async fn capture(&self, name: &str, lines: u32) -> anyhow::Result<String>;
}

/// 调用 tmux 二进制的传输层
pub struct CommandTransport {
    socket: Option<String>,
}

impl CommandTransport {
    pub fn new(socket: Option<String>) -> Self {
        Self { socket }
    }

    /// tmux 是否已安装
    pub fn is_available() -> bool {
        which::which("tmux").is_ok()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        if let Some(socket) = &self.socket {
            cmd.args(["-L", socket]);
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<std::process::Output> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute tmux {}", args.first().unwrap_or(&"")))?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(anyhow!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

impl Default for CommandTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl TmuxTransport for CommandTransport {
    async fn new_session(&self, name: &str, working_dir: &str) -> anyhow::Result<()> {
        self.run(&["new-session", "-d", "-s", name, "-c", working_dir]).await?;
        Ok(())
    }

    async fn kill_session(&self, name: &str) -> anyhow::Result<()> {
        self.run(&["kill-session", "-t", name]).await?;
        Ok(())
    }

    async fn has_session(&self, name: &str) -> bool {
        self.command()
            .args(["has-session", "-t", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn list_sessions(&self) -> anyhow::Result<Vec<SessionSummary>> {
        let output = self
            .command()
            .args([
                "list-sessions",
                "-F",
                "#{session_name}|#{session_created}|#{session_attached}",
            ])
            .output()
            .await
            .context("Failed to execute tmux list-sessions")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            return Err(anyhow!("tmux list-sessions failed: {}", stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_session_line)
            .collect())
    }

    async fn send_literal(&self, name: &str, text: &str) -> anyhow::Result<()> {
        // `--` 防止以 `-` 开头的文本被当作参数
        self.run(&["send-keys", "-t", name, "-l", "--", text]).await?;
        Ok(())
    }

    async fn send_key(&self, name: &str, key: &str) -> anyhow::Result<()> {
        self.run(&["send-keys", "-t", name, key]).await?;
        Ok(())
    }

    async fn capture(&self, name: &str, lines: u32) -> anyhow::Result<String> {
        let start = format!("-{}", lines);
        let output = self
            .run(&["capture-pane", "-t", name, "-p", "-S", &start])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// 解析 `name|created|attached` 行
fn parse_session_line(line: &str) -> Option<SessionSummary> {
    let mut parts = line.splitn(3, '|');
    let name = parts.next()?.to_string();
    let created: i64 = parts.next()?.trim().parse().ok()?;
    let attached: u32 = parts.next()?.trim().parse().unwrap_or(0);
    Some(SessionSummary {
        name,
        created_at: Utc.timestamp_opt(created, 0).single()?,
        attached: attached > 0,
    })
}

/// tmux 会话控制器
pub struct TmuxManager {
    transport: Arc<dyn TmuxTransport>,
    config: TmuxConfig,
    /// 最近确认存活的 session（名称 -> 确认时间）
    known: Mutex<HashMap<String, Instant>>,
}

impl TmuxManager {
    pub fn new(transport: Arc<dyn TmuxTransport>, config: TmuxConfig) -> Self {
        Self {
            transport,
            config,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// 使用真实 tmux 的控制器
    pub fn with_command_transport(config: TmuxConfig) -> Self {
        let transport = Arc::new(CommandTransport::new(config.socket.clone()));
        Self::new(transport, config)
    }

    pub fn config(&self) -> &TmuxConfig {
        &self.config
    }

    fn remember(&self, name: &str) {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.insert(name.to_string(), Instant::now());
    }

    fn forget(&self, name: &str) {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.remove(name);
    }

    fn recently_seen(&self, name: &str) -> bool {
        let known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known
            .get(name)
            .map(|seen| seen.elapsed() < self.config.session_cache_ttl())
            .unwrap_or(false)
    }

    /// 校验 session 名称
    pub fn validate_name(name: &str) -> Result<()> {
        if SESSION_NAME_RE.is_match(name) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidParameter(format!(
                "invalid session name {:?}: use letters, digits, '-' or '_'",
                name
            )))
        }
    }

    /// 创建新的 tmux session
    pub async fn create_session(&self, name: &str, working_dir: &str) -> Result<Session> {
        Self::validate_name(name)?;
        if working_dir.trim().is_empty() {
            return Err(OrchestratorError::InvalidParameter(
                "working directory must not be empty".to_string(),
            ));
        }

        debug!(session = %name, working_dir = %working_dir, "Creating tmux session");

        self.forget(name);
        if self.transport.has_session(name).await {
            self.remember(name);
            return Err(OrchestratorError::AlreadyExists(name.to_string()));
        }

        self.transport
            .new_session(name, working_dir)
            .await
            .map_err(|e| {
                error!(session = %name, error = %e, "Failed to create tmux session");
                OrchestratorError::Tmux(e.to_string())
            })?;

        self.remember(name);
        info!(session = %name, "Tmux session created");

        Ok(Session {
            name: name.to_string(),
            role: None,
            working_directory: working_dir.to_string(),
            lifecycle_state: LifecycleState::Created,
            created_at: Utc::now(),
        })
    }

    /// 终止 session；session 不存在时只记录日志
    pub async fn kill_session(&self, name: &str) {
        self.forget(name);
        match self.transport.kill_session(name).await {
            Ok(()) => info!(session = %name, "Tmux session killed"),
            Err(e) => debug!(session = %name, error = %e, "Kill skipped, session not running"),
        }
    }

    /// 检查 session 是否存在
    pub async fn session_exists(&self, name: &str) -> bool {
        if self.recently_seen(name) {
            return true;
        }
        let exists = self.transport.has_session(name).await;
        if exists {
            self.remember(name);
        } else {
            self.forget(name);
        }
        exists
    }

    /// 列出所有 tmux sessions；tmux 不可用时返回空列表
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        match self.transport.list_sessions().await {
            Ok(sessions) => {
                let now = Instant::now();
                let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
                known.clear();
                for s in &sessions {
                    known.insert(s.name.clone(), now);
                }
                sessions
            }
            Err(e) => {
                warn!(error = %e, "Failed to list tmux sessions");
                Vec::new()
            }
        }
    }

    async fn ensure_exists(&self, name: &str) -> Result<()> {
        if self.session_exists(name).await {
            Ok(())
        } else {
            Err(OrchestratorError::SessionNotFound(name.to_string()))
        }
    }

    /// 字面发送文本，超过阈值时分块发送
    pub async fn send_literal_input(&self, name: &str, text: &str) -> Result<()> {
        self.ensure_exists(name).await?;

        let chunks = split_for_delivery(text, self.config.chunk_size);
        let total = chunks.len();
        debug!(session = %name, bytes = text.len(), chunks = total, "Sending literal input");

        for (i, chunk) in chunks.into_iter().enumerate() {
            if i > 0 {
                sleep(self.config.chunk_delay()).await;
            }
            self.transport.send_literal(name, chunk).await.map_err(|e| {
                error!(session = %name, chunk = i, error = %e, "Failed to send text to tmux");
                OrchestratorError::Tmux(e.to_string())
            })?;
        }
        Ok(())
    }

    /// 发送一条消息：文本、等待渲染、再单独发送 Enter
    pub async fn send_message(&self, name: &str, text: &str) -> Result<()> {
        info!(session = %name, len = text.len(), "Sending message to tmux session");
        self.send_literal_input(name, text).await?;

        // 交互程序需要时间渲染输入，提交键必须单独发送
        sleep(self.config.message_settle()).await;

        self.transport
            .send_key(name, &ControlKey::Enter.tmux_name())
            .await
            .map_err(|e| {
                error!(session = %name, error = %e, "Failed to send Enter key");
                OrchestratorError::Tmux(e.to_string())
            })
    }

    /// 发送单个非字面按键，不附加 Enter
    pub async fn send_control_key(&self, name: &str, key: ControlKey) -> Result<()> {
        self.ensure_exists(name).await?;
        self.transport
            .send_key(name, &key.tmux_name())
            .await
            .map_err(|e| OrchestratorError::Tmux(e.to_string()))
    }

    /// 捕获最后 N 行；失败时返回空字符串
    pub async fn capture_pane(&self, name: &str, lines: u32) -> String {
        match self.transport.capture(name, lines).await {
            Ok(output) => output.trim().to_string(),
            Err(e) => {
                debug!(session = %name, error = %e, "Capture failed, treating as empty");
                String::new()
            }
        }
    }
}
