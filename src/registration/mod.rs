//! 注册状态机 - 把新建的 session 推进到"agent 已确认"状态
//!
//! ## 子模块
//!
//! - `machine` - 四级递进恢复策略
//! - `prompts` - 按角色的注册提示模板
//!
//! 成功的唯一依据是外部存储中的注册确认。

pub mod machine;
pub mod prompts;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RegistrationConfig;
use crate::infra::LifecycleState;
use crate::runtime::RuntimeType;

pub use machine::RegistrationMachine;
pub use prompts::{render_template, PromptLibrary};

/// 递进的恢复策略，按 1 → 4 的顺序尝试
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 1. 直接发送注册提示
    DirectPrompt,
    /// 2. 中断 + 重新启动运行时
    CleanupReinit,
    /// 3. 销毁并重建 session
    FullRecreate,
    /// 4. 放弃
    GiveUp,
}

impl Strategy {
    /// 实际执行的策略（不含放弃）
    pub const ESCALATION: [Strategy; 3] = [
        Strategy::DirectPrompt,
        Strategy::CleanupReinit,
        Strategy::FullRecreate,
    ];

    pub fn number(&self) -> u8 {
        match self {
            Strategy::DirectPrompt => 1,
            Strategy::CleanupReinit => 2,
            Strategy::FullRecreate => 3,
            Strategy::GiveUp => 4,
        }
    }

    pub fn budget(&self, config: &RegistrationConfig) -> Duration {
        let secs = match self {
            Strategy::DirectPrompt => config.direct_prompt_budget_secs,
            Strategy::CleanupReinit => config.cleanup_budget_secs,
            Strategy::FullRecreate => config.recreate_budget_secs,
            Strategy::GiveUp => 0,
        };
        Duration::from_secs(secs)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::DirectPrompt => "direct_prompt",
            Strategy::CleanupReinit => "cleanup_reinit",
            Strategy::FullRecreate => "full_recreate",
            Strategy::GiveUp => "give_up",
        };
        write!(f, "{}", name)
    }
}

/// 单次尝试的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum AttemptOutcome {
    Pending,
    Success,
    Failure(String),
}

/// 一次策略尝试，只存在于单次注册运行中
#[derive(Debug, Clone)]
pub struct RegistrationAttempt {
    pub session_name: String,
    pub strategy: Strategy,
    pub started_at: Instant,
    pub deadline: Instant,
    pub outcome: AttemptOutcome,
}

impl RegistrationAttempt {
    pub fn new(session_name: &str, strategy: Strategy, deadline: Instant) -> Self {
        Self {
            session_name: session_name.to_string(),
            strategy,
            started_at: Instant::now(),
            deadline,
            outcome: AttemptOutcome::Pending,
        }
    }

    pub fn summary(&self) -> AttemptSummary {
        AttemptSummary {
            strategy: self.strategy,
            outcome: self.outcome.clone(),
            elapsed: self.started_at.elapsed(),
        }
    }
}

/// 返回给调用方的尝试摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub strategy: Strategy,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// 注册请求
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub session_name: String,
    pub role: String,
    pub working_directory: String,
    pub overall_timeout: Duration,
    pub member_id: Option<String>,
    pub runtime: RuntimeType,
}

impl RegistrationRequest {
    pub fn new(session_name: &str, role: &str, working_directory: &str, overall_timeout: Duration) -> Self {
        Self {
            session_name: session_name.to_string(),
            role: role.to_string(),
            working_directory: working_directory.to_string(),
            overall_timeout,
            member_id: None,
            runtime: RuntimeType::default(),
        }
    }

    pub fn with_member_id(mut self, member_id: Option<String>) -> Self {
        self.member_id = member_id;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeType) -> Self {
        self.runtime = runtime;
        self
    }
}

/// 注册成功
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationReport {
    pub session_name: String,
    pub role: String,
    pub state: LifecycleState,
    pub strategy: Strategy,
    pub elapsed: Duration,
    pub attempts: Vec<AttemptSummary>,
}

/// 所有策略失败，供 API 层生成可读的错误信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationFailure {
    pub session_name: String,
    pub role: String,
    pub elapsed: Duration,
    /// 最后实际执行的策略；一个都没来得及执行时为 `None`
    pub last_strategy: Option<Strategy>,
    pub attempts: Vec<AttemptSummary>,
}

impl std::fmt::Display for RegistrationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last = match self.last_strategy {
            Some(Strategy::FullRecreate) => "after full session recreation".to_string(),
            Some(Strategy::CleanupReinit) => "after cleanup and reinitialization".to_string(),
            Some(Strategy::DirectPrompt) => "after a direct registration prompt".to_string(),
            Some(Strategy::GiveUp) | None => "before any strategy could run".to_string(),
        };
        write!(
            f,
            "agent {} ({}) did not register {} ({:.1}s elapsed)",
            self.session_name,
            self.role,
            last,
            self.elapsed.as_secs_f64()
        )
    }
}
