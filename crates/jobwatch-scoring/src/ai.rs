//! External AI scoring capability.
//!
//! The scorer is injected behind [`AiScorer`]. When AI scoring is not
//! configured the [`DisabledAiScorer`] stands in, so the hybrid scorer
//! never branches on configuration flags.

use std::sync::Arc;

use async_trait::async_trait;
use jobwatch_core::{AiSettings, Error, JobPosting, Preferences, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

/// Characters per token used for cost estimates.
const CHARS_PER_TOKEN: usize = 4;
const PROMPT_OVERHEAD_TOKENS: u64 = 250;
const MAX_DESCRIPTION_CHARS: usize = 6000;

/// Verdict returned by an AI scorer.
#[derive(Debug, Clone, PartialEq)]
pub struct AiVerdict {
    /// Fit score in [0, 1].
    pub score: f64,
    pub reasons: Vec<String>,
    pub summary: Option<String>,
    pub tokens_used: u64,
}

#[async_trait]
pub trait AiScorer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this scorer can make calls at all.
    fn is_available(&self) -> bool;

    /// Rough token cost of scoring `posting`, used to reserve budget.
    fn estimate_tokens(&self, posting: &JobPosting) -> u64 {
        estimate_prompt_tokens(posting)
    }

    async fn score(&self, posting: &JobPosting, prefs: &Preferences) -> Result<AiVerdict>;
}

/// Rough prompt size: description is truncated the same way the prompt is.
pub fn estimate_prompt_tokens(posting: &JobPosting) -> u64 {
    let chars = posting.title.len()
        + posting.location.len()
        + posting.description.len().min(MAX_DESCRIPTION_CHARS);
    PROMPT_OVERHEAD_TOKENS + (chars / CHARS_PER_TOKEN) as u64
}

// ---------------------------------------------------------------
// Disabled
// ---------------------------------------------------------------

/// Stand-in used when no AI backend is configured.
pub struct DisabledAiScorer;

#[async_trait]
impl AiScorer for DisabledAiScorer {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn score(&self, _posting: &JobPosting, _prefs: &Preferences) -> Result<AiVerdict> {
        Err(Error::Scoring("AI scoring is not configured".into()))
    }
}

// ---------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------

/// Scores postings with an OpenAI-compatible `/chat/completions` endpoint
/// in JSON mode.
pub struct OpenAiScorer {
    client: Client,
    api_key: String,
    settings: AiSettings,
}

impl OpenAiScorer {
    pub fn new(api_key: String, settings: AiSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| Error::Scoring(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            settings,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl AiScorer for OpenAiScorer {
    fn name(&self) -> &str {
        &self.settings.model
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn estimate_tokens(&self, posting: &JobPosting) -> u64 {
        estimate_prompt_tokens(posting) + self.settings.max_tokens as u64
    }

    async fn score(&self, posting: &JobPosting, prefs: &Preferences) -> Result<AiVerdict> {
        let body = json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": build_prompt(posting, prefs)},
            ],
        });

        debug!("Scoring posting {} with {}", posting.id, self.settings.model);

        let response = self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Scoring(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Scoring(format!("API error {}: {}", status, body)));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Scoring(format!("Invalid response: {}", e)))?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| Error::Scoring("Response has no message content".into()))?;
        let tokens_used = parsed["usage"]["total_tokens"]
            .as_u64()
            .unwrap_or_else(|| estimate_prompt_tokens(posting));

        parse_verdict(content, tokens_used)
    }
}

const SYSTEM_PROMPT: &str = "You rate how well a job posting fits a candidate's preferences. \
Reply with a JSON object: {\"score\": number between 0 and 1, \"reasons\": [short strings], \
\"summary\": one sentence}.";

fn build_prompt(posting: &JobPosting, prefs: &Preferences) -> String {
    let description: String = posting.description.chars().take(MAX_DESCRIPTION_CHARS).collect();
    let salary = match (posting.salary_min, posting.salary_max) {
        (Some(min), Some(max)) if min != max => format!("{} - {}", min, max),
        (_, Some(max)) => max.to_string(),
        _ => posting.salary_text.clone().unwrap_or_else(|| "not listed".into()),
    };
    format!(
        "Preferences:\n- Target titles: {}\n- Avoid titles: {}\n- Preferred keywords: {}\n\
         - Locations: {}\n- Minimum salary (USD): {}\n\n\
         Posting:\nTitle: {}\nLocation: {}\nSalary: {}\nDescription:\n{}",
        prefs.title_allowlist.join(", "),
        prefs.title_blocklist.join(", "),
        prefs.keywords_boost.join(", "),
        if prefs.location_constraints.is_empty() {
            "any".to_string()
        } else {
            prefs.location_constraints.join(", ")
        },
        prefs
            .salary_floor_usd
            .map(|f| f.to_string())
            .unwrap_or_else(|| "none".into()),
        posting.title,
        posting.location,
        salary,
        description,
    )
}

#[derive(Deserialize)]
struct RawVerdict {
    score: f64,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// Parse the model's JSON reply. Scores given on a 0-100 scale are
/// rescaled; anything else outside [0, 1] is rejected.
pub fn parse_verdict(content: &str, tokens_used: u64) -> Result<AiVerdict> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let raw: RawVerdict = serde_json::from_str(trimmed)
        .map_err(|e| Error::Scoring(format!("Unparseable verdict: {}", e)))?;

    let score = if (0.0..=1.0).contains(&raw.score) {
        raw.score
    } else if (1.0..=100.0).contains(&raw.score) {
        raw.score / 100.0
    } else {
        return Err(Error::Scoring(format!("Score out of range: {}", raw.score)));
    };

    Ok(AiVerdict {
        score,
        reasons: raw.reasons,
        summary: raw.summary.filter(|s| !s.trim().is_empty()),
        tokens_used,
    })
}

/// Build the AI scorer from settings. Without an API key the disabled
/// scorer is returned and hybrid scoring falls back to rules.
pub fn create_ai_scorer(settings: &AiSettings) -> Arc<dyn AiScorer> {
    let api_key = match std::env::var(&settings.api_key_env) {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            warn!(
                "{} is not set; AI scoring unavailable, using rule scores only",
                settings.api_key_env
            );
            return Arc::new(DisabledAiScorer);
        }
    };
    match OpenAiScorer::new(api_key, settings.clone()) {
        Ok(scorer) => {
            info!("AI scorer ready: {} at {}", settings.model, settings.base_url);
            Arc::new(scorer)
        }
        Err(e) => {
            warn!("Failed to initialize AI scorer: {}; using rule scores only", e);
            Arc::new(DisabledAiScorer)
        }
    }
}
