//! 配置模块 - 从 `~/.config/agentmux/config.json` 加载
//!
//! 所有字段都有默认值，配置文件不存在时直接使用默认配置。
//! 时间相关字段统一以毫秒或秒存储，通过方法转换为 `Duration`。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// 消息提交前的最小等待时间（毫秒）
pub const MIN_MESSAGE_SETTLE_MS: u64 = 500;

/// 配置目录
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/agentmux")
}

/// 默认配置文件路径
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// 顶层配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub tmux: TmuxConfig,
    pub probe: ProbeConfig,
    pub registration: RegistrationConfig,
    pub activity: ActivityConfig,
    pub store: StoreConfig,
}

impl OrchestratorConfig {
    /// 从默认路径加载
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// 从指定路径加载；文件不存在时返回默认配置
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))?;
        config.normalize();
        Ok(config)
    }

    /// 修正不合法的取值
    pub fn normalize(&mut self) {
        if self.tmux.message_settle_ms < MIN_MESSAGE_SETTLE_MS {
            warn!(
                configured = self.tmux.message_settle_ms,
                min = MIN_MESSAGE_SETTLE_MS,
                "message_settle_ms too small, clamping"
            );
            self.tmux.message_settle_ms = MIN_MESSAGE_SETTLE_MS;
        }
        if self.tmux.chunk_size == 0 {
            self.tmux.chunk_size = TmuxConfig::default().chunk_size;
        }
        if self.probe.shell_delta_max < self.probe.shell_delta_min {
            self.probe.shell_delta_max = self.probe.shell_delta_min;
        }
    }
}

/// tmux 交互参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
    /// tmux socket 名称（`tmux -L <name>`），为空时使用默认 server
    pub socket: Option<String>,
    /// 超过此字节数的输入分块发送
    pub chunk_size: usize,
    /// 分块之间的间隔（毫秒）
    pub chunk_delay_ms: u64,
    /// 文本输入与 Enter 之间的等待（毫秒），最小 500
    pub message_settle_ms: u64,
    /// 已知 session 缓存的有效期（毫秒）
    pub session_cache_ttl_ms: u64,
    /// 默认捕获行数
    pub capture_lines: u32,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            socket: None,
            chunk_size: 1500,
            chunk_delay_ms: 100,
            message_settle_ms: 500,
            session_cache_ttl_ms: 2000,
            capture_lines: 100,
        }
    }
}

impl TmuxConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    pub fn message_settle(&self) -> Duration {
        Duration::from_millis(self.message_settle_ms.max(MIN_MESSAGE_SETTLE_MS))
    }

    pub fn session_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.session_cache_ttl_ms)
    }
}

/// 运行时探测参数
///
/// 长度差阈值是经验值，不同终端程序可能需要调整。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// 探测结果的有效期（秒）
    pub freshness_secs: u64,
    /// 发送探测字符后的等待（毫秒）
    pub settle_ms: u64,
    /// 判定为普通 shell 的最小长度差
    pub shell_delta_min: usize,
    /// 判定为普通 shell 的最大长度差
    pub shell_delta_max: usize,
    /// 探测字符
    pub probe_key: char,
    /// 出现即判定为 agent 的 UI 标记
    pub ui_markers: Vec<String>,
    /// 等待进行中探测的轮询间隔（毫秒）
    pub wait_poll_ms: u64,
    /// 等待进行中探测的最大轮询次数
    pub wait_max_polls: u32,
    /// 探测时捕获的行数
    pub capture_lines: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 30,
            settle_ms: 2000,
            shell_delta_min: 2,
            shell_delta_max: 5,
            probe_key: '/',
            ui_markers: vec![
                "/help".to_string(),
                "/clear".to_string(),
                "/compact".to_string(),
                "/chat".to_string(),
                "/model".to_string(),
            ],
            wait_poll_ms: 500,
            wait_max_polls: 10,
            capture_lines: 50,
        }
    }
}

impl ProbeConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// 并发调用者等待进行中探测的上限
    pub fn dedup_wait(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms) * self.wait_max_polls
    }
}

/// 注册状态机参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub direct_prompt_budget_secs: u64,
    pub cleanup_budget_secs: u64,
    pub recreate_budget_secs: u64,
    /// 整体超时（秒），调用方未指定时使用
    pub overall_timeout_secs: u64,
    /// 轮询外部存储的间隔（毫秒）
    pub confirmation_poll_ms: u64,
    /// 轮询 ready 标记的间隔（毫秒）
    pub ready_poll_ms: u64,
    /// 等待 ready 标记的子超时（秒）
    pub ready_timeout_secs: u64,
    /// 清理阶段发送的中断键次数
    pub interrupt_count: u32,
    /// 中断键之间的间隔（毫秒）
    pub interrupt_gap_ms: u64,
    /// 中断后等待 shell 恢复的时间（毫秒）
    pub after_interrupt_ms: u64,
    /// 覆盖运行时的启动命令，key 为运行时名称
    pub startup_commands: HashMap<String, String>,
    /// 额外的 ready 短语
    pub extra_ready_phrases: Vec<String>,
    /// 自定义注册提示模板目录（`<role>-prompt.md`）
    pub prompt_dir: Option<PathBuf>,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            direct_prompt_budget_secs: 15,
            cleanup_budget_secs: 30,
            recreate_budget_secs: 45,
            overall_timeout_secs: 90,
            confirmation_poll_ms: 2000,
            ready_poll_ms: 2000,
            ready_timeout_secs: 20,
            interrupt_count: 3,
            interrupt_gap_ms: 300,
            after_interrupt_ms: 1000,
            startup_commands: HashMap::new(),
            extra_ready_phrases: Vec::new(),
            prompt_dir: None,
        }
    }
}

impl RegistrationConfig {
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }

    pub fn confirmation_poll(&self) -> Duration {
        Duration::from_millis(self.confirmation_poll_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn interrupt_gap(&self) -> Duration {
        Duration::from_millis(self.interrupt_gap_ms)
    }

    pub fn after_interrupt(&self) -> Duration {
        Duration::from_millis(self.after_interrupt_ms)
    }
}

/// 活动监控参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub interval_secs: u64,
    pub capture_lines: u32,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            capture_lines: 50,
        }
    }
}

impl ActivityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// 存储位置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: config_dir().join("data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.tmux.chunk_size, 1500);
        assert_eq!(config.probe.freshness(), Duration::from_secs(30));
        assert_eq!(config.probe.dedup_wait(), Duration::from_secs(5));
        assert_eq!(config.registration.direct_prompt_budget_secs, 15);
        assert_eq!(config.registration.cleanup_budget_secs, 30);
        assert_eq!(config.registration.recreate_budget_secs, 45);
        assert_eq!(config.activity.interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config.tmux.message_settle_ms, 500);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults_and_clamps_settle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"tmux":{"message_settle_ms":100},"probe":{"shell_delta_max":8}}"#,
        )
        .unwrap();

        let config = OrchestratorConfig::load_from(&path).unwrap();
        assert_eq!(config.tmux.message_settle_ms, MIN_MESSAGE_SETTLE_MS);
        assert_eq!(config.tmux.chunk_size, 1500);
        assert_eq!(config.probe.shell_delta_max, 8);
        assert_eq!(config.probe.shell_delta_min, 2);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(OrchestratorConfig::load_from(&path).is_err());
    }
}
