//! Jobwatch runtime: run lock, notification dispatch, and the orchestrator
//! that drives poll, digest, cleanup and health runs.

pub mod lock;
pub mod notify;
pub mod orchestrator;
pub mod types;

pub use lock::{LockInfo, RunLock, RunLockGuard};
pub use notify::{dispatch, Channel, DeliveryOutcome, DispatchResult, LogNotifier, Notifier};
pub use orchestrator::Orchestrator;
pub use types::*;
