//! agentmux - 在 tmux 中托管编码 agent 的会话生命周期编排
//!
//! 负责创建 session、判断 agent 是否真正可交互、按递进策略完成注册、
//! 定时 check-in 投递以及活动状态监控。

pub mod activity;
pub mod cli;
pub mod config;
pub mod error;
pub mod infra;
pub mod orchestrator;
pub mod registration;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use activity::{derive_status, ActivityMonitor, ActivitySample, TickReport};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use infra::{
    CancelToken, CommandTransport, ControlKey, LifecycleState, Session, SessionSummary,
    TmuxManager, TmuxTransport,
};
pub use orchestrator::{Orchestrator, SpawnRequest};
pub use registration::{
    RegistrationFailure, RegistrationMachine, RegistrationReport, RegistrationRequest, Strategy,
};
pub use runtime::{ProbeOutcome, RuntimeProbe, RuntimeType};
pub use scheduler::{CheckSchedule, CheckinScheduler, ScheduledCheck};
pub use store::{
    AgentStatus, DeliveryLogEntry, JsonFileStore, MemberRecord, MemoryStore, SharedStore,
    StateStore, WorkingStatus,
};
