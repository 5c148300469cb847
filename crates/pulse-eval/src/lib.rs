//! # pulse-eval
//!
//! The decision layer: "should the agent think about this right now?"
//!
//! Two implementations share one interface. The [`RuleEvaluator`] is
//! threshold math; the [`ModelEvaluator`] asks a small LLM and falls back to
//! the rules after consecutive failures. Calibration is everything — too
//! sensitive is noisy and expensive, too conservative is inert.

pub mod model;
pub mod rules;

pub use model::ModelEvaluator;
pub use rules::RuleEvaluator;

use async_trait::async_trait;
use pulse_core::{DriveState, SensorSnapshot, TriggerDecision};

/// Decides, given drive state and sensor context, whether to trigger now
/// and which drive is on top. Cooldown and hourly rate limiting are NOT
/// here — the daemon governs every trigger path uniformly.
#[async_trait]
pub trait Evaluator: Send {
    async fn decide(
        &mut self,
        drives: &DriveState,
        sensors: &SensorSnapshot,
        now: f64,
    ) -> TriggerDecision;

    /// "rules" or "model".
    fn mode(&self) -> &'static str;

    /// True while a model evaluator is delegating to its rule fallback.
    fn degraded(&self) -> bool {
        false
    }

    /// Feed a dispatched trigger's outcome back for prompt context.
    fn record_trigger(&mut self, _decision: &TriggerDecision, _success: bool) {}
}
