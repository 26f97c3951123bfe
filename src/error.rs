//! 错误类型 - 会话编排的错误分类

use std::time::Duration;
use thiserror::Error;

use crate::registration::RegistrationFailure;

/// 编排层统一错误
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// tmux 层面找不到 session，调用方通常视为"无事可做"
    #[error("tmux session not found: {0}")]
    SessionNotFound(String),

    #[error("tmux session already exists: {0}")]
    AlreadyExists(String),

    /// ready 提示在子超时内始终未出现
    #[error("runtime in session {session} not ready after {waited:?}")]
    RuntimeUnavailable { session: String, waited: Duration },

    /// 外部存储在预算内没有出现注册确认
    #[error("registration of {session} as {role} not confirmed within {waited:?}")]
    RegistrationTimeout {
        session: String,
        role: String,
        waited: Duration,
    },

    /// 四个策略全部失败
    #[error("{0}")]
    EscalationExhausted(Box<RegistrationFailure>),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("tmux command failed: {0}")]
    Tmux(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
