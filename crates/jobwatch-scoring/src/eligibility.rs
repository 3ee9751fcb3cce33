//! Notification eligibility from a combined score.

use jobwatch_core::Preferences;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    /// At or above the immediate-alert threshold.
    Immediate,
    /// At or above the digest threshold only.
    Digest,
    /// Stored but not surfaced.
    None,
}

pub fn eligibility(combined_score: f64, prefs: &Preferences) -> Eligibility {
    if combined_score >= prefs.immediate_alert_threshold {
        Eligibility::Immediate
    } else if combined_score >= prefs.digest_threshold {
        Eligibility::Digest
    } else {
        Eligibility::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_are_inclusive() {
        let prefs = Preferences::with_allowlist(["Engineer"]);
        assert_eq!(eligibility(0.9, &prefs), Eligibility::Immediate);
        assert_eq!(eligibility(0.89, &prefs), Eligibility::Digest);
        assert_eq!(eligibility(0.5, &prefs), Eligibility::Digest);
        assert_eq!(eligibility(0.49, &prefs), Eligibility::None);
    }
}
