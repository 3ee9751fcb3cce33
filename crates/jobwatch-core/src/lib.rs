//! Jobwatch Core: error taxonomy, configuration, shared posting types.

pub mod config;
pub mod error;
pub mod salary;
pub mod types;

pub use config::{
    AiSettings, DataPaths, JobwatchConfig, Preferences, RateLimitSettings, ResilienceSettings,
    RunSettings, ScoringWeights, SourceDescriptor, SourceType, StoreSettings,
};
pub use error::{Error, FetchError, FetchErrorKind, Result};
pub use types::*;
