//! Database schema SQL.

/// Postings, score records, domain health and token usage.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS postings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_type TEXT NOT NULL,
    external_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    title TEXT NOT NULL,
    location TEXT NOT NULL,
    salary_text TEXT,
    salary_min INTEGER,
    salary_max INTEGER,
    description TEXT NOT NULL,
    url TEXT NOT NULL,
    posted_at INTEGER,
    content_hash TEXT NOT NULL,
    first_seen_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    needs_rescore INTEGER NOT NULL DEFAULT 1,
    alert_sent_at INTEGER,
    digest_sent_at INTEGER,
    UNIQUE (source_type, external_id)
);

CREATE INDEX IF NOT EXISTS idx_postings_status ON postings(status);
CREATE INDEX IF NOT EXISTS idx_postings_last_seen ON postings(last_seen_at);
CREATE INDEX IF NOT EXISTS idx_postings_rescore ON postings(needs_rescore);

CREATE TABLE IF NOT EXISTS score_records (
    posting_id INTEGER PRIMARY KEY REFERENCES postings(id) ON DELETE CASCADE,
    rule_score REAL NOT NULL,
    ai_score REAL,
    combined_score REAL NOT NULL,
    matched_reasons_json TEXT NOT NULL,
    scoring_method TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    computed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scores_combined ON score_records(combined_score);

CREATE TABLE IF NOT EXISTS domain_health (
    origin TEXT PRIMARY KEY,
    consecutive_failures INTEGER NOT NULL,
    backoff_until INTEGER,
    circuit_state TEXT NOT NULL,
    last_failure_at INTEGER,
    last_success_at INTEGER
);

CREATE TABLE IF NOT EXISTS token_usage (
    usage_date TEXT PRIMARY KEY,
    tokens_used INTEGER NOT NULL,
    requests INTEGER NOT NULL
);
"#;

/// Tables and columns a store file must carry to be considered intact.
pub const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "postings",
        &[
            "id",
            "source_type",
            "external_id",
            "source_id",
            "title",
            "location",
            "description",
            "url",
            "content_hash",
            "first_seen_at",
            "last_seen_at",
            "status",
            "needs_rescore",
            "alert_sent_at",
            "digest_sent_at",
        ],
    ),
    (
        "score_records",
        &[
            "posting_id",
            "rule_score",
            "ai_score",
            "combined_score",
            "matched_reasons_json",
            "scoring_method",
            "content_hash",
            "computed_at",
        ],
    ),
    (
        "domain_health",
        &["origin", "consecutive_failures", "backoff_until", "circuit_state"],
    ),
    ("token_usage", &["usage_date", "tokens_used", "requests"]),
];
