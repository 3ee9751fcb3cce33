//! Rule scorer: a pure function of posting and preferences.

use jobwatch_core::salary::format_usd;
use jobwatch_core::{JobPosting, Preferences};

/// Outcome of rule scoring. Reasons are in evaluation order.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleResult {
    pub score: f64,
    pub reasons: Vec<String>,
    pub disqualified: bool,
}

impl RuleResult {
    fn disqualified(detail: String) -> Self {
        Self {
            score: 0.0,
            reasons: vec!["disqualified".to_string(), detail],
            disqualified: true,
        }
    }
}

/// Score `posting` against `prefs`.
///
/// Disqualification (no allowlisted title, a blocklisted title term, or an
/// excluded keyword anywhere) short-circuits to 0. Otherwise the title
/// weight is granted and the location, keyword and salary contributions
/// are added; the sum is clamped to [0, 1].
pub fn score_rules(posting: &JobPosting, prefs: &Preferences) -> RuleResult {
    let title = posting.title.to_lowercase();
    let body = format!("{} {}", title, posting.description.to_lowercase());
    let weights = &prefs.weights;

    let Some(matched_title) = find_term(&title, &prefs.title_allowlist) else {
        return RuleResult::disqualified("Title not in allowlist".to_string());
    };
    if let Some(blocked) = find_term(&title, &prefs.title_blocklist) {
        return RuleResult::disqualified(format!("Title contains blocked term '{}'", blocked));
    }
    if let Some(excluded) = find_term(&body, &prefs.keywords_exclude) {
        return RuleResult::disqualified(format!("Excluded keyword '{}'", excluded));
    }

    let mut score = weights.title_match;
    let mut reasons = vec![format!("Title matched '{}'", matched_title)];

    if prefs.location_constraints.is_empty() {
        score += weights.location_match;
        reasons.push("No location constraints".to_string());
    } else if let Some(location) =
        find_term(&posting.location.to_lowercase(), &prefs.location_constraints)
    {
        score += weights.location_match;
        reasons.push(format!("Location matched '{}'", location));
    }

    let mut keyword_total = 0.0;
    for keyword in &prefs.keywords_boost {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() || !body.contains(&needle) {
            continue;
        }
        let room = weights.keyword_cap - keyword_total;
        if room <= f64::EPSILON {
            break;
        }
        keyword_total += weights.keyword_boost.min(room);
        reasons.push(format!("Keyword boost: '{}'", keyword.trim()));
    }
    score += keyword_total;

    if let (Some(floor), Some(max)) = (prefs.salary_floor_usd, posting.salary_max) {
        if max >= floor {
            score += weights.salary_floor_met;
            reasons.push(format!(
                "Salary {} meets floor {}",
                format_usd(max),
                format_usd(floor)
            ));
        }
    }

    RuleResult {
        score: round4(score.clamp(0.0, 1.0)),
        reasons,
        disqualified: false,
    }
}

/// First term (as configured) contained in `haystack`, case-insensitively.
fn find_term<'a>(haystack: &str, terms: &'a [String]) -> Option<&'a str> {
    terms
        .iter()
        .map(|t| t.trim())
        .find(|t| !t.is_empty() && haystack.contains(&t.to_lowercase()))
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
