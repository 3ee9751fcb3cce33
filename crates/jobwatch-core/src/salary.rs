//! Salary detection in posting text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

const MIN_PLAUSIBLE_USD: u64 = 30_000;
const MAX_PLAUSIBLE_USD: u64 = 1_000_000;

static BARE_AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s?(k)?\b").unwrap());

// Groups 1-2: "$150k" / "USD 150,000"; groups 3-4: "150,000 USD".
static MARKED_AMOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:\$\s?|\busd\s?)(\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s?(k)?\b|(\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s?(k)?\s?usd\b",
    )
    .unwrap()
});

/// Detected annual salary range in USD. `min == max` for a single figure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalaryRange {
    pub min: u64,
    pub max: u64,
}

impl SalaryRange {
    fn from_amounts(amounts: &[u64]) -> Option<Self> {
        let pair = &amounts[..amounts.len().min(2)];
        let min = *pair.iter().min()?;
        let max = *pair.iter().max()?;
        Some(Self { min, max })
    }
}

/// Parse a dedicated salary field such as `"$140,000 - $180,000"` or `"150k"`.
pub fn parse_salary_text(text: &str) -> Option<SalaryRange> {
    let amounts: Vec<u64> = BARE_AMOUNT_RE
        .captures_iter(text)
        .filter_map(|caps| to_usd(caps.get(1)?.as_str(), caps.get(2).is_some()))
        .collect();
    SalaryRange::from_amounts(&amounts)
}

/// Find a salary in free text. Only currency-marked figures count, so
/// "401k" or "5 years" never read as pay.
pub fn find_salary_in_text(text: &str) -> Option<SalaryRange> {
    let amounts: Vec<u64> = MARKED_AMOUNT_RE
        .captures_iter(text)
        .filter_map(|caps| {
            if let Some(num) = caps.get(1) {
                to_usd(num.as_str(), caps.get(2).is_some())
            } else {
                to_usd(caps.get(3)?.as_str(), caps.get(4).is_some())
            }
        })
        .collect();
    SalaryRange::from_amounts(&amounts)
}

fn to_usd(number: &str, thousands: bool) -> Option<u64> {
    let value: f64 = number.replace(',', "").parse().ok()?;
    let value = if thousands { value * 1000.0 } else { value };
    let amount = value.round() as u64;
    (MIN_PLAUSIBLE_USD..=MAX_PLAUSIBLE_USD)
        .contains(&amount)
        .then_some(amount)
}

/// Format a whole-dollar amount as `$160,000`.
pub fn format_usd(amount: u64) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    out.push('$');
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_figure() {
        assert_eq!(
            parse_salary_text("$160,000"),
            Some(SalaryRange { min: 160_000, max: 160_000 })
        );
    }

    #[test]
    fn test_range_with_k_suffix() {
        assert_eq!(
            parse_salary_text("$150k - $185K per year"),
            Some(SalaryRange { min: 150_000, max: 185_000 })
        );
    }

    #[test]
    fn test_implausible_amounts_ignored() {
        assert_eq!(parse_salary_text("5 years, 2 openings"), None);
        assert_eq!(parse_salary_text("$5,000,000"), None);
    }

    #[test]
    fn test_free_text_requires_currency_marker() {
        assert_eq!(find_salary_in_text("Great 401k match and 150000 perks"), None);
        assert_eq!(
            find_salary_in_text("Base pay is 155,000 USD plus equity"),
            Some(SalaryRange { min: 155_000, max: 155_000 })
        );
        assert_eq!(
            find_salary_in_text("Range: $140,000 to $180,000. Bonus up to $20,000."),
            Some(SalaryRange { min: 140_000, max: 180_000 })
        );
    }

    #[test]
    fn test_format_usd() {
        assert_eq!(format_usd(160_000), "$160,000");
        assert_eq!(format_usd(1_000_000), "$1,000,000");
        assert_eq!(format_usd(999), "$999");
    }
}
