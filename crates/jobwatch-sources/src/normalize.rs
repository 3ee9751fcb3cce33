//! Draft normalization: trimming, validation, salary detection and the
//! content hash that drives change detection.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use jobwatch_core::salary::{find_salary_in_text, parse_salary_text};
use jobwatch_core::{DraftPosting, FetchError, JobPosting, PostingStatus, SourceDescriptor};
use sha2::{Digest, Sha256};
use tracing::warn;

const FIELD_SEPARATOR: char = '\u{1f}';

/// Postings ready for upsert plus the number of drafts rejected.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub postings: Vec<JobPosting>,
    pub invalid: usize,
}

/// Normalize one source's drafts, preserving board order. Invalid drafts
/// and repeated external ids within the batch are dropped with a warning.
pub fn normalize_drafts(
    source: &SourceDescriptor,
    drafts: Vec<DraftPosting>,
    now: DateTime<Utc>,
) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    let mut seen = HashSet::new();
    for draft in drafts {
        match normalize_draft(source, draft, now) {
            Ok(posting) => {
                if seen.insert(posting.external_id.clone()) {
                    batch.postings.push(posting);
                } else {
                    warn!(
                        "Source '{}' repeated posting {}; keeping the first",
                        source.id, posting.external_id
                    );
                }
            }
            Err(e) => {
                warn!("Source '{}' produced an invalid posting: {}", source.id, e);
                batch.invalid += 1;
            }
        }
    }
    batch
}

/// Normalize a single draft. Fails when the identity or title is empty.
pub fn normalize_draft(
    source: &SourceDescriptor,
    draft: DraftPosting,
    now: DateTime<Utc>,
) -> Result<JobPosting, FetchError> {
    let external_id = draft.external_id.trim().to_string();
    let title = draft.title.trim().to_string();
    if external_id.is_empty() {
        return Err(FetchError::parse(format!("posting '{}' has no external id", title)));
    }
    if title.is_empty() {
        return Err(FetchError::parse(format!("posting {} has no title", external_id)));
    }

    let location = draft.location.trim().to_string();
    let description = draft.description.trim().to_string();
    let salary_text = draft
        .salary_text
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let salary = salary_text
        .as_deref()
        .and_then(parse_salary_text)
        .or_else(|| find_salary_in_text(&description));
    let url = match draft.url.trim() {
        "" => source.url.clone(),
        url => url.to_string(),
    };
    let hash = content_hash(&title, &location, salary_text.as_deref(), &description);

    Ok(JobPosting {
        id: 0,
        source_type: source.source_type,
        external_id,
        source_id: source.id.clone(),
        title,
        location,
        salary_text,
        salary_min: salary.map(|s| s.min),
        salary_max: salary.map(|s| s.max),
        description,
        url,
        posted_at: draft.posted_at,
        content_hash: hash,
        first_seen_at: now,
        last_seen_at: now,
        status: PostingStatus::Active,
        alert_sent_at: None,
        digest_sent_at: None,
    })
}

/// SHA-256 over the case- and whitespace-normalized content fields.
pub fn content_hash(
    title: &str,
    location: &str,
    salary_text: Option<&str>,
    description: &str,
) -> String {
    let mut hasher = Sha256::new();
    for (i, field) in [title, location, salary_text.unwrap_or(""), description]
        .iter()
        .enumerate()
    {
        if i > 0 {
            hasher.update(FIELD_SEPARATOR.to_string().as_bytes());
        }
        hasher.update(canonical(field).as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn canonical(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_core::SourceType;

    fn source() -> SourceDescriptor {
        SourceDescriptor {
            id: "acme".into(),
            source_type: SourceType::Lever,
            url: "https://jobs.example.com/acme".into(),
            enabled: true,
        }
    }

    fn draft(id: &str, title: &str) -> DraftPosting {
        DraftPosting {
            external_id: id.into(),
            title: title.into(),
            location: "Remote".into(),
            description: "Work on detection. Pay: $150k - $170k".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_hash_ignores_case_and_whitespace() {
        let a = content_hash("Security  Engineer", "Remote", None, "desc");
        let b = content_hash(" security engineer", "REMOTE ", None, "desc\n");
        assert_eq!(a, b);
        assert_ne!(a, content_hash("Security Engineer", "Remote", None, "other"));
    }

    #[test]
    fn test_hash_fields_do_not_run_together() {
        assert_ne!(
            content_hash("ab", "c", None, ""),
            content_hash("a", "bc", None, "")
        );
    }

    #[test]
    fn test_normalize_fills_salary_and_url() {
        let now = Utc::now();
        let posting = normalize_draft(&source(), draft(" 7 ", " Engineer "), now).unwrap();
        assert_eq!(posting.external_id, "7");
        assert_eq!(posting.title, "Engineer");
        assert_eq!(posting.url, "https://jobs.example.com/acme");
        assert_eq!(posting.salary_min, Some(150_000));
        assert_eq!(posting.salary_max, Some(170_000));
        assert_eq!(posting.source_type, SourceType::Lever);
        assert_eq!(posting.first_seen_at, now);
    }

    #[test]
    fn test_salary_field_takes_precedence() {
        let mut d = draft("1", "Engineer");
        d.salary_text = Some("$160,000".into());
        let posting = normalize_draft(&source(), d, Utc::now()).unwrap();
        assert_eq!(posting.salary_max, Some(160_000));
    }

    #[test]
    fn test_invalid_and_repeated_drafts_dropped() {
        let drafts = vec![
            draft("1", "Engineer"),
            draft("", "No id"),
            draft("2", "   "),
            draft("1", "Engineer again"),
        ];
        let batch = normalize_drafts(&source(), drafts, Utc::now());
        assert_eq!(batch.postings.len(), 1);
        assert_eq!(batch.invalid, 2);
    }
}
