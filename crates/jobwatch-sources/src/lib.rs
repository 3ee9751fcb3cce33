//! Jobwatch Sources: board adapters and per-origin resilience.
//!
//! Adapters translate one board's raw data into drafts. Every network call
//! they make goes through the [`DomainHealthTracker`], which owns
//! circuit-breaker state and request pacing per origin.

pub mod adapter;
pub mod health;
pub mod http;
pub mod normalize;
pub mod pacing;

pub use adapter::{AdapterRegistry, BoardAdapter, JsonFeedAdapter};
pub use health::{origin_of, Admission, DomainHealthTracker};
pub use http::HttpClient;
pub use normalize::{content_hash, normalize_drafts, NormalizedBatch};
pub use pacing::RequestPacer;
