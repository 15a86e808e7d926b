//! Session reward engine for the runner "mining" dashboard.
//!
//! Income arrives from three sources (passive ticks, challenge solves and
//! distance milestones), is folded into one statistics record per account
//! and can be withdrawn through an external payout service.

pub mod accounts;
pub mod api;
pub mod dashboard;
pub mod error;
pub mod mining;
pub mod sim;
pub mod verify;
pub mod withdrawals;

pub use error::{EngineError, ErrorKind};
pub use mining::{spawn_engine, EngineConfig, EngineHandle, Snapshot};
