pub mod decision;
pub mod scorer;

pub use decision::{DecisionPhase, EntryDecision};
pub use scorer::{score, ComponentScore, ScoreBreakdown};
