//! CLI command handling

pub mod agent;
pub mod checkin;
pub mod output;
pub mod session;

pub use agent::*;
pub use checkin::*;
pub use output::*;
pub use session::*;
