//! Configuration and data directory management.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Paths to all Jobwatch data files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// Durable job store (`data/jobs.sqlite`).
    pub store_file: PathBuf,
    /// Backup generations (`data/backups/`).
    pub backups: PathBuf,
    /// Run lock marker (`data/jobwatch.lock`).
    pub lock_file: PathBuf,
    /// Default configuration file (`data/jobwatch.json`).
    pub config_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            store_file: root.join("jobs.sqlite"),
            backups: root.join("backups"),
            lock_file: root.join("jobwatch.lock"),
            config_file: root.join("jobwatch.json"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    /// Create the root and backup directories if missing.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.backups)?;
        Ok(())
    }
}

// ---------------------------------------------------------------
// Sources
// ---------------------------------------------------------------

/// Job board family. Adapters are registered per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Greenhouse,
    Lever,
    Workday,
    GenericJs,
    /// Pre-normalized JSON feed of draft postings.
    JsonFeed,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greenhouse => "greenhouse",
            Self::Lever => "lever",
            Self::Workday => "workday",
            Self::GenericJs => "generic_js",
            Self::JsonFeed => "json_feed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "greenhouse" => Some(Self::Greenhouse),
            "lever" => Some(Self::Lever),
            "workday" => Some(Self::Workday),
            "generic_js" => Some(Self::GenericJs),
            "json_feed" => Some(Self::JsonFeed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured job source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub source_type: SourceType,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ---------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------

/// Additive weights used by the rule scorer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub title_match: f64,
    pub location_match: f64,
    pub keyword_boost: f64,
    /// Upper bound on the summed keyword contribution.
    pub keyword_cap: f64,
    pub salary_floor_met: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            title_match: 0.6,
            location_match: 0.2,
            keyword_boost: 0.05,
            keyword_cap: 0.15,
            salary_floor_met: 0.1,
        }
    }
}

/// User-defined matching criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preferences {
    pub title_allowlist: Vec<String>,
    #[serde(default)]
    pub title_blocklist: Vec<String>,
    #[serde(default)]
    pub keywords_boost: Vec<String>,
    #[serde(default)]
    pub keywords_exclude: Vec<String>,
    /// Empty means any location is acceptable.
    #[serde(default)]
    pub location_constraints: Vec<String>,
    #[serde(default)]
    pub salary_floor_usd: Option<u64>,
    #[serde(default = "default_immediate_threshold")]
    pub immediate_alert_threshold: f64,
    #[serde(default = "default_digest_threshold")]
    pub digest_threshold: f64,
    #[serde(default)]
    pub ai_enabled: bool,
    /// Share of the AI score in the hybrid combination.
    #[serde(default = "default_llm_weight")]
    pub llm_weight: f64,
    #[serde(default = "default_max_sources")]
    pub max_sources_per_run: usize,
    #[serde(default)]
    pub weights: ScoringWeights,
}

fn default_true() -> bool {
    true
}
fn default_immediate_threshold() -> f64 {
    0.9
}
fn default_digest_threshold() -> f64 {
    0.5
}
fn default_llm_weight() -> f64 {
    0.5
}
fn default_max_sources() -> usize {
    10
}

impl Preferences {
    /// Preferences with the given allowlist and defaults everywhere else.
    pub fn with_allowlist<I, S>(titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            title_allowlist: titles.into_iter().map(Into::into).collect(),
            title_blocklist: Vec::new(),
            keywords_boost: Vec::new(),
            keywords_exclude: Vec::new(),
            location_constraints: Vec::new(),
            salary_floor_usd: None,
            immediate_alert_threshold: default_immediate_threshold(),
            digest_threshold: default_digest_threshold(),
            ai_enabled: false,
            llm_weight: default_llm_weight(),
            max_sources_per_run: default_max_sources(),
            weights: ScoringWeights::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.title_allowlist.iter().all(|t| t.trim().is_empty()) {
            return Err(Error::Config("title_allowlist cannot be empty".into()));
        }
        for (name, value) in [
            ("immediate_alert_threshold", self.immediate_alert_threshold),
            ("digest_threshold", self.digest_threshold),
            ("llm_weight", self.llm_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be between 0 and 1", name)));
            }
        }
        if self.digest_threshold > self.immediate_alert_threshold {
            return Err(Error::Config(
                "digest_threshold must not exceed immediate_alert_threshold".into(),
            ));
        }
        if self.max_sources_per_run < 1 {
            return Err(Error::Config("max_sources_per_run must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------
// Tuning sections
// ---------------------------------------------------------------

/// Circuit breaker and retry tuning for the domain health tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub base_delay_secs: u64,
    pub backoff_exponent_cap: u32,
    /// The circuit opens once consecutive failures exceed this value.
    pub failure_threshold: u32,
    pub jitter_max_ms: u64,
    pub max_immediate_retries: u32,
    pub retry_base_delay_ms: u64,
    pub fetch_timeout_secs: u64,
    /// Politeness limit for origins without an override.
    pub rate_limit: RateLimitSettings,
    /// Per-host limits, keyed by host name (`boards.greenhouse.io`).
    pub rate_limit_overrides: HashMap<String, RateLimitSettings>,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            base_delay_secs: 30,
            backoff_exponent_cap: 4,
            failure_threshold: 2,
            jitter_max_ms: 5000,
            max_immediate_retries: 2,
            retry_base_delay_ms: 500,
            fetch_timeout_secs: 30,
            rate_limit: RateLimitSettings::default(),
            rate_limit_overrides: default_rate_limit_overrides(),
        }
    }
}

fn default_rate_limit_overrides() -> HashMap<String, RateLimitSettings> {
    [
        ("boards.greenhouse.io", 20, 3000),
        ("boards-api.greenhouse.io", 20, 3000),
        ("jobs.lever.co", 15, 4000),
        ("api.lever.co", 15, 4000),
        ("jobs.ashbyhq.com", 20, 3000),
        ("api.ashbyhq.com", 20, 3000),
        ("jobs.smartrecruiters.com", 15, 4000),
        ("careers.workday.com", 10, 6000),
    ]
    .into_iter()
    .map(|(host, requests_per_minute, min_delay_ms)| {
        (
            host.to_string(),
            RateLimitSettings {
                requests_per_minute,
                min_delay_ms,
            },
        )
    })
    .collect()
}

impl ResilienceSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Limit applying to `host`.
    pub fn rate_limit_for(&self, host: &str) -> &RateLimitSettings {
        self.rate_limit_overrides
            .get(&host.to_ascii_lowercase())
            .unwrap_or(&self.rate_limit)
    }
}

/// Request pacing for one origin. A zero value disables that bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub requests_per_minute: u32,
    /// Minimum spacing between requests; stretched by up to 2x while the
    /// origin is failing.
    pub min_delay_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            min_delay_ms: 2000,
        }
    }
}

impl RateLimitSettings {
    /// No pacing at all.
    pub fn unlimited() -> Self {
        Self {
            requests_per_minute: 0,
            min_delay_ms: 0,
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }
}

/// Retention and staleness settings for the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub staleness_window_hours: u64,
    pub max_backups: usize,
    pub backup_interval_hours: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            staleness_window_hours: 72,
            max_backups: 7,
            backup_interval_hours: 24,
        }
    }
}

impl StoreSettings {
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.staleness_window_hours as i64)
    }

    pub fn backup_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.backup_interval_hours as i64)
    }
}

/// External AI scoring capability and its budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub daily_token_cap: u64,
    pub requests_per_minute: u32,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            api_key_env: "OPENAI_API_KEY".into(),
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.0,
            max_tokens: 500,
            timeout_secs: 20,
            daily_token_cap: 50_000,
            requests_per_minute: 20,
        }
    }
}

impl AiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// A lock older than this is reclaimed even if its owner is alive.
    pub max_run_duration_secs: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_run_duration_secs: 2 * 60 * 60,
        }
    }
}

impl RunSettings {
    pub fn max_run_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_run_duration_secs as i64)
    }
}

// ---------------------------------------------------------------
// Top-level
// ---------------------------------------------------------------

/// Configuration file contents (`jobwatch.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    preferences: Preferences,
    sources: Vec<SourceDescriptor>,
    #[serde(default)]
    resilience: ResilienceSettings,
    #[serde(default)]
    store: StoreSettings,
    #[serde(default)]
    ai: AiSettings,
    #[serde(default)]
    run: RunSettings,
}

/// Top-level Jobwatch configuration.
#[derive(Debug, Clone)]
pub struct JobwatchConfig {
    pub data_paths: DataPaths,
    pub preferences: Preferences,
    pub sources: Vec<SourceDescriptor>,
    pub resilience: ResilienceSettings,
    pub store: StoreSettings,
    pub ai: AiSettings,
    pub run: RunSettings,
}

impl JobwatchConfig {
    /// Build a configuration in code, with default tuning sections.
    pub fn new(
        data_dir: impl AsRef<Path>,
        preferences: Preferences,
        sources: Vec<SourceDescriptor>,
    ) -> Result<Self> {
        Ok(Self {
            data_paths: DataPaths::new(data_dir)?,
            preferences,
            sources,
            resilience: ResilienceSettings::default(),
            store: StoreSettings::default(),
            ai: AiSettings::default(),
            run: RunSettings::default(),
        })
    }

    /// Load and validate configuration.
    ///
    /// The file defaults to `<data_dir>/jobwatch.json`; `JOBWATCH_CONFIG`
    /// overrides it when `config_path` is `None`.
    pub fn load(data_dir: impl AsRef<Path>, config_path: Option<&Path>) -> Result<Self> {
        let data_paths = DataPaths::new(data_dir)?;
        let path = match config_path {
            Some(p) => p.to_path_buf(),
            None => std::env::var("JOBWATCH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_paths.config_file.clone()),
        };

        let raw = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid JSON in {}: {}", path.display(), e)))?;

        let config = Self {
            data_paths,
            preferences: file.preferences,
            sources: file.sources,
            resilience: file.resilience,
            store: file.store,
            ai: file.ai,
            run: file.run,
        };
        config.validate()?;

        info!(
            "Configuration loaded: {} sources, ai_enabled={}, path={}",
            config.sources.len(),
            config.preferences.ai_enabled,
            path.display()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.preferences.validate()?;
        if self.sources.is_empty() {
            return Err(Error::Config("No sources configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(Error::Config("Source with empty id".into()));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(Error::Config(format!("Duplicate source id: {}", source.id)));
            }
            if !source.url.starts_with("http://") && !source.url.starts_with("https://") {
                return Err(Error::Config(format!(
                    "Invalid URL for source {}: {}",
                    source.id, source.url
                )));
            }
        }
        if self.store.max_backups == 0 {
            warn!("store.max_backups is 0: backups will be pruned immediately");
        }
        Ok(())
    }

    /// Enabled sources, capped at `max_sources_per_run`, in file order.
    pub fn sources_for_run(&self) -> Vec<SourceDescriptor> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .take(self.preferences.max_sources_per_run)
            .cloned()
            .collect()
    }
}
