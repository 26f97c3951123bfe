//! 基础设施层 - tmux、终端文本、等待原语、按 key 加锁

pub mod keyed;
pub mod poll;
pub mod terminal;
pub mod tmux;

pub use keyed::KeyedLocks;
pub use poll::{poll_until, sleep_or_cancel, CancelToken};
pub use tmux::{
    CommandTransport, ControlKey, LifecycleState, Session, SessionSummary, TmuxManager,
    TmuxTransport,
};
