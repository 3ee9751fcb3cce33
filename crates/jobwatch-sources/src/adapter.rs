//! Board adapter contract and the enum-keyed adapter registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::{DraftPosting, Error, FetchError, Result, SourceDescriptor, SourceType};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http::HttpClient;

/// Translates one board type's raw data into draft postings.
///
/// Implementations perform a single fetch attempt; retries and circuit
/// breaking are applied around them by the domain health tracker.
#[async_trait]
pub trait BoardAdapter: Send + Sync {
    /// The board type this adapter serves.
    fn source_type(&self) -> SourceType;

    /// Fetch the current postings of `source`, in board order.
    async fn fetch(&self, source: &SourceDescriptor) -> std::result::Result<Vec<DraftPosting>, FetchError>;
}

/// Adapters keyed by [`SourceType`]. Registration is explicit; a source
/// whose type has no adapter fails on its own without affecting others.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<SourceType, Arc<dyn BoardAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `json_feed` adapter.
    pub fn with_defaults(client: HttpClient) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonFeedAdapter::new(client)));
        registry
    }

    /// Register an adapter, replacing any previous one for its type.
    pub fn register(&mut self, adapter: Arc<dyn BoardAdapter>) -> Option<Arc<dyn BoardAdapter>> {
        let source_type = adapter.source_type();
        debug!("Registered adapter for {}", source_type);
        self.adapters.insert(source_type, adapter)
    }

    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn BoardAdapter>> {
        self.adapters.get(&source_type).cloned()
    }

    /// Adapter for `source`, or a configuration error naming the source.
    pub fn resolve(&self, source: &SourceDescriptor) -> Result<Arc<dyn BoardAdapter>> {
        self.get(source.source_type).ok_or_else(|| {
            Error::Config(format!(
                "no adapter registered for source type '{}' (source '{}')",
                source.source_type, source.id
            ))
        })
    }

    pub fn source_types(&self) -> Vec<SourceType> {
        let mut types: Vec<SourceType> = self.adapters.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

// ---------------------------------------------------------------
// json_feed
// ---------------------------------------------------------------

/// Generic adapter for boards that publish a JSON list of postings, either
/// as a bare array or wrapped as `{"jobs": [...]}`.
pub struct JsonFeedAdapter {
    client: HttpClient,
}

impl JsonFeedAdapter {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BoardAdapter for JsonFeedAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::JsonFeed
    }

    async fn fetch(&self, source: &SourceDescriptor) -> std::result::Result<Vec<DraftPosting>, FetchError> {
        let body: serde_json::Value = self.client.get_json(&source.url).await?;
        let drafts = decode_feed(body)?;
        debug!("Source '{}' returned {} postings", source.id, drafts.len());
        Ok(drafts)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedId {
    Text(String),
    Number(i64),
}

#[derive(Deserialize)]
struct FeedItem {
    #[serde(alias = "id")]
    external_id: FeedId,
    title: String,
    #[serde(default)]
    location: String,
    #[serde(default, alias = "salary")]
    salary_text: Option<String>,
    #[serde(default, alias = "content")]
    description: String,
    #[serde(default, alias = "absolute_url")]
    url: String,
    #[serde(default, alias = "updated_at")]
    posted_at: Option<DateTime<Utc>>,
}

impl From<FeedItem> for DraftPosting {
    fn from(item: FeedItem) -> Self {
        let external_id = match item.external_id {
            FeedId::Text(s) => s,
            FeedId::Number(n) => n.to_string(),
        };
        DraftPosting {
            external_id,
            title: item.title,
            location: item.location,
            salary_text: item.salary_text,
            description: item.description,
            url: item.url,
            posted_at: item.posted_at,
        }
    }
}

/// Decode a feed document. A document of the wrong shape is a parse error;
/// individual malformed items are skipped.
pub fn decode_feed(body: serde_json::Value) -> std::result::Result<Vec<DraftPosting>, FetchError> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("jobs") {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Err(FetchError::parse("feed object has no 'jobs' array")),
        },
        other => {
            return Err(FetchError::parse(format!(
                "unexpected feed document: {}",
                type_name(&other)
            )))
        }
    };

    let mut drafts = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<FeedItem>(item) {
            Ok(item) => drafts.push(item.into()),
            Err(e) => warn!("Skipping malformed feed item #{}: {}", index, e),
        }
    }
    Ok(drafts)
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_core::FetchErrorKind;
    use serde_json::json;

    struct StaticAdapter;

    #[async_trait]
    impl BoardAdapter for StaticAdapter {
        fn source_type(&self) -> SourceType {
            SourceType::Greenhouse
        }

        async fn fetch(&self, _source: &SourceDescriptor) -> std::result::Result<Vec<DraftPosting>, FetchError> {
            Ok(vec![DraftPosting {
                external_id: "1".into(),
                title: "Engineer".into(),
                ..Default::default()
            }])
        }
    }

    fn source(source_type: SourceType) -> SourceDescriptor {
        SourceDescriptor {
            id: "acme".into(),
            source_type,
            url: "https://boards.example.com/acme".into(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_type() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.register(Arc::new(StaticAdapter)).is_none());

        let adapter = registry.resolve(&source(SourceType::Greenhouse)).unwrap();
        let drafts = adapter.fetch(&source(SourceType::Greenhouse)).await.unwrap();
        assert_eq!(drafts.len(), 1);

        let err = registry.resolve(&source(SourceType::Lever)).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(registry.source_types(), vec![SourceType::Greenhouse]);
    }

    #[test]
    fn test_decode_wrapped_feed() {
        let body = json!({
            "jobs": [
                {"id": 42, "title": "Security Engineer", "location": "Remote", "salary": "$160,000"},
                {"external_id": "abc", "title": "Designer", "absolute_url": "https://x.example/abc"}
            ]
        });
        let drafts = decode_feed(body).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].external_id, "42");
        assert_eq!(drafts[0].salary_text.as_deref(), Some("$160,000"));
        assert_eq!(drafts[1].url, "https://x.example/abc");
    }

    #[test]
    fn test_decode_skips_malformed_items() {
        let body = json!([{"id": "1", "title": "Engineer"}, {"title": "no id"}, 7]);
        let drafts = decode_feed(body).unwrap();
        assert_eq!(drafts.len(), 1);
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let err = decode_feed(json!({"postings": []})).unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::ParseError);
        let err = decode_feed(json!("hello")).unwrap_err();
        assert!(!err.is_retryable());
    }
}
