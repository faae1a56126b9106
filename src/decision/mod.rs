// =============================================================================
// Decision Pipeline
// =============================================================================
//
// The pipeline for one request:
//   validate snapshot -> confluence score -> policy rules -> drift factor
//
// Scoring and rules are pure; only the engine touches the store (calibration
// read with a sub-budget, trace enqueue with a hard deadline).

pub mod engine;
pub mod rules;
pub mod scorer;

pub use engine::{Decision, DecisionEngine, DecisionEnvelope};
pub use rules::PolicyOverrider;
pub use scorer::score_snapshot;

/// Hard ceiling on any confidence returned to the EA.
pub const MAX_CONF: f64 = 0.95;
