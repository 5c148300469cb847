use async_trait::async_trait;
use tracing::{debug, info};

use pulse_config::PulseConfig;
use pulse_core::{DriveState, SensorSnapshot, SharedTunables, TriggerDecision};

use crate::Evaluator;

/// Threshold-based trigger decisions.
///
/// A trigger needs both the combined weighted pressure over the threshold
/// AND at least one individual drive above the minimum floor — many tiny
/// drives summing past the threshold is ambient noise, not intent.
pub struct RuleEvaluator {
    tunables: SharedTunables,
    min_individual_pressure: f64,
    activity_threshold_secs: f64,
    high_pressure_threshold: f64,
    high_pressure_idle_secs: f64,
}

impl RuleEvaluator {
    pub fn new(config: &PulseConfig, tunables: SharedTunables) -> Self {
        Self {
            tunables,
            min_individual_pressure: config.drives.min_individual_pressure,
            activity_threshold_secs: config.evaluator.rules.activity_threshold_secs as f64,
            high_pressure_threshold: config.drives.high_pressure_threshold,
            high_pressure_idle_secs: config.drives.high_pressure_idle_secs as f64,
        }
    }

    /// The unconditional escape hatch: extreme pressure plus a long-idle
    /// system must wake the agent no matter which evaluator is active.
    pub fn high_pressure_override(
        &self,
        drives: &DriveState,
        sensors: &SensorSnapshot,
    ) -> Option<TriggerDecision> {
        if drives.total_pressure <= self.high_pressure_threshold {
            return None;
        }
        let idle_secs = sensors
            .conversation
            .seconds_since_last_message
            .unwrap_or(f64::INFINITY);
        if idle_secs <= self.high_pressure_idle_secs {
            return None;
        }
        info!(
            total_pressure = drives.total_pressure,
            idle_secs, "high pressure override"
        );
        let mut decision = TriggerDecision::trigger("high pressure override", drives);
        decision.sensor_context = sensors.context_line();
        Some(decision)
    }

    /// Conversation suppression applies to every evaluator mode. Activity
    /// within `activity_threshold_secs` suppresses regardless of how the
    /// sensor flagged it; the sensor's `active`/`in_cooldown` flags cover
    /// sources that report no timing.
    pub fn conversation_suppressed(
        &self,
        drives: &DriveState,
        sensors: &SensorSnapshot,
    ) -> Option<TriggerDecision> {
        let recently_active = sensors
            .conversation
            .seconds_since_last_message
            .is_some_and(|s| s < self.activity_threshold_secs);
        if sensors.conversation.active || recently_active || sensors.conversation.in_cooldown {
            let since = sensors
                .conversation
                .seconds_since_last_message
                .map(|s| format!("{s:.0}s ago"))
                .unwrap_or_else(|| "just now".into());
            debug!(last_activity = %since, "trigger suppressed by conversation");
            return Some(TriggerDecision::no_trigger("conversation suppressed", drives));
        }
        None
    }
}

#[async_trait]
impl Evaluator for RuleEvaluator {
    async fn decide(
        &mut self,
        drives: &DriveState,
        sensors: &SensorSnapshot,
        _now: f64,
    ) -> TriggerDecision {
        if let Some(suppressed) = self.conversation_suppressed(drives, sensors) {
            return suppressed;
        }

        if let Some(decision) = self.high_pressure_override(drives, sensors) {
            return decision;
        }

        let threshold = self.tunables.read().trigger_threshold;
        if drives.total_pressure >= threshold
            && drives.max_individual_pressure() >= self.min_individual_pressure
        {
            let mut decision = TriggerDecision::trigger("threshold exceeded", drives);
            decision.sensor_context = sensors.context_line();
            return decision;
        }

        TriggerDecision::no_trigger("below threshold", drives)
    }

    fn mode(&self) -> &'static str {
        "rules"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use pulse_core::{Drive, Tunables};
    use std::sync::Arc;

    fn tunables(threshold: f64) -> SharedTunables {
        Arc::new(RwLock::new(Tunables {
            trigger_threshold: threshold,
            pressure_rate: 0.05,
            min_trigger_interval_secs: 300,
            max_turns_per_hour: 10,
        }))
    }

    fn evaluator(threshold: f64) -> RuleEvaluator {
        RuleEvaluator::new(&PulseConfig::default(), tunables(threshold))
    }

    fn state(pressures: &[(&str, f64)]) -> DriveState {
        let drives = pressures
            .iter()
            .map(|(name, p)| {
                let mut d = Drive::new(*name, 1.0);
                d.pressure = *p;
                d
            })
            .collect();
        DriveState::new(drives, 0.0)
    }

    fn idle_sensors(idle_secs: f64) -> SensorSnapshot {
        let mut s = SensorSnapshot::default();
        s.conversation.seconds_since_last_message = Some(idle_secs);
        s
    }

    #[tokio::test]
    async fn single_drive_over_threshold_triggers() {
        let mut eval = evaluator(5.0);
        let drives = state(&[("goals", 5.1), ("curiosity", 0.0)]);
        let decision = eval
            .decide(&drives, &idle_sensors(10_000.0), 0.0)
            .await;
        assert!(decision.should_trigger);
        assert_eq!(decision.reason, "threshold exceeded");
        assert_eq!(decision.top_drive.unwrap().name, "goals");
    }

    #[tokio::test]
    async fn many_tiny_drives_do_not_trigger() {
        // Six drives at 0.85 sum to 5.1, all below the 1.5 floor.
        let mut eval = evaluator(5.0);
        let drives = state(&[
            ("a", 0.85),
            ("b", 0.85),
            ("c", 0.85),
            ("d", 0.85),
            ("e", 0.85),
            ("f", 0.85),
        ]);
        let decision = eval.decide(&drives, &idle_sensors(10_000.0), 0.0).await;
        assert!(!decision.should_trigger);
        assert_eq!(decision.reason, "below threshold");
    }

    #[tokio::test]
    async fn conversation_activity_suppresses() {
        let mut eval = evaluator(5.0);
        let drives = state(&[("goals", 9.0)]);
        let mut sensors = SensorSnapshot::default();
        sensors.conversation.active = true;
        sensors.conversation.seconds_since_last_message = Some(10.0);
        let decision = eval.decide(&drives, &sensors, 0.0).await;
        assert!(!decision.should_trigger);
        assert_eq!(decision.reason, "conversation suppressed");
    }

    #[tokio::test]
    async fn recent_activity_suppresses_without_sensor_flags() {
        // Activity 60s ago is inside the default 120s threshold even when
        // the sensor set neither active nor in_cooldown.
        let mut eval = evaluator(5.0);
        let drives = state(&[("goals", 9.0)]);
        let decision = eval.decide(&drives, &idle_sensors(60.0), 0.0).await;
        assert!(!decision.should_trigger);
        assert_eq!(decision.reason, "conversation suppressed");
    }

    #[tokio::test]
    async fn activity_threshold_is_the_governing_knob() {
        let mut config = PulseConfig::default();
        config.evaluator.rules.activity_threshold_secs = 30;
        let mut eval = RuleEvaluator::new(&config, tunables(5.0));
        let drives = state(&[("goals", 9.0)]);
        // 60s ago is outside a 30s threshold: no suppression, trigger fires.
        let decision = eval.decide(&drives, &idle_sensors(60.0), 0.0).await;
        assert!(decision.should_trigger);
        // 20s ago is inside it.
        let decision = eval.decide(&drives, &idle_sensors(20.0), 0.0).await;
        assert!(!decision.should_trigger);
        assert_eq!(decision.reason, "conversation suppressed");
    }

    #[tokio::test]
    async fn cooldown_window_also_suppresses() {
        let mut eval = evaluator(5.0);
        let drives = state(&[("goals", 9.0)]);
        let mut sensors = SensorSnapshot::default();
        sensors.conversation.in_cooldown = true;
        sensors.conversation.seconds_since_last_message = Some(200.0);
        let decision = eval.decide(&drives, &sensors, 0.0).await;
        assert!(!decision.should_trigger);
    }

    #[tokio::test]
    async fn high_pressure_override_fires_when_idle() {
        let mut eval = evaluator(50.0); // threshold unreachably high
        let drives = state(&[("goals", 6.0), ("curiosity", 5.0)]);
        let decision = eval.decide(&drives, &idle_sensors(2000.0), 0.0).await;
        assert!(decision.should_trigger);
        assert_eq!(decision.reason, "high pressure override");
    }

    #[tokio::test]
    async fn high_pressure_override_needs_idle() {
        let mut eval = evaluator(50.0);
        let drives = state(&[("goals", 6.0), ("curiosity", 5.0)]);
        // Recent conversation activity — not idle enough.
        let decision = eval.decide(&drives, &idle_sensors(600.0), 0.0).await;
        assert!(!decision.should_trigger);
    }

    #[tokio::test]
    async fn no_activity_signal_counts_as_idle() {
        let mut eval = evaluator(50.0);
        let drives = state(&[("goals", 6.0), ("curiosity", 5.0)]);
        let decision = eval
            .decide(&drives, &SensorSnapshot::default(), 0.0)
            .await;
        assert!(decision.should_trigger);
    }

    #[tokio::test]
    async fn threshold_reads_live_tunables() {
        let shared = tunables(5.0);
        let mut eval = RuleEvaluator::new(&PulseConfig::default(), shared.clone());
        let drives = state(&[("goals", 5.5)]);
        assert!(eval.decide(&drives, &idle_sensors(1e6), 0.0).await.should_trigger);

        shared.write().trigger_threshold = 6.0;
        assert!(!eval.decide(&drives, &idle_sensors(1e6), 0.0).await.should_trigger);
    }

    #[tokio::test]
    async fn zero_pressure_never_triggers() {
        let mut eval = evaluator(0.5);
        let drives = state(&[("goals", 0.0)]);
        let decision = eval.decide(&drives, &idle_sensors(1e6), 0.0).await;
        assert!(!decision.should_trigger);
    }
}
