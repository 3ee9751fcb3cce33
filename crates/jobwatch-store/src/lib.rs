//! Jobwatch Store: deduplicated SQLite job store with atomic snapshots,
//! checksummed backup generations and startup integrity recovery.

pub mod backup;
pub mod schema;
pub mod snapshot;
pub mod sqlite;
pub mod types;

pub use backup::{BackupInfo, BackupManager};
pub use sqlite::{inspect, JobStore};
pub use types::*;
