//! Jobwatch Scoring: deterministic rule scoring, budget-limited AI
//! scoring, and the hybrid combination of the two.

pub mod ai;
pub mod budget;
pub mod eligibility;
pub mod hybrid;
pub mod rules;

pub use ai::{create_ai_scorer, AiScorer, AiVerdict, DisabledAiScorer, OpenAiScorer};
pub use budget::{BudgetDenial, Reservation, TokenBudget};
pub use eligibility::{eligibility, Eligibility};
pub use hybrid::HybridScorer;
pub use rules::{score_rules, RuleResult};
