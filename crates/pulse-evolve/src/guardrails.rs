use tracing::warn;

use pulse_config::schema::GuardrailConfig;
use pulse_core::PulseError;

/// Pure-logic predicate layer applied before any mutation takes effect.
///
/// Rejections never mutate: an out-of-range value is refused outright (with
/// the rule name for the audit log), never silently applied at a different
/// value. The one exception is drive weight, whose contract is clamping —
/// the per-call delta bound and range are folded into the applied value and
/// the original request is recorded alongside.
pub struct Guardrails {
    cfg: GuardrailConfig,
    /// Rolling-hour mutation timestamps (epoch seconds). Persisted so a
    /// restart does not reset the window.
    mutation_timestamps: Vec<f64>,
}

impl Guardrails {
    pub fn new(cfg: GuardrailConfig, persisted_timestamps: Vec<f64>, now: f64) -> Self {
        let mutation_timestamps = persisted_timestamps
            .into_iter()
            .filter(|t| now - *t < 3600.0)
            .collect();
        Self {
            cfg,
            mutation_timestamps,
        }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.cfg
    }

    /// The rolling window, for persistence.
    pub fn mutation_timestamps(&self) -> &[f64] {
        &self.mutation_timestamps
    }

    /// Enforce the global mutation rate limit. A passing check consumes one
    /// slot in the window — attempts count, not just successes.
    pub fn check_mutation_rate(&mut self, now: f64) -> pulse_core::Result<()> {
        self.mutation_timestamps.retain(|t| now - *t < 3600.0);
        if self.mutation_timestamps.len() >= self.cfg.max_mutations_per_hour {
            warn!(
                count = self.mutation_timestamps.len(),
                max = self.cfg.max_mutations_per_hour,
                "mutation rate limit hit"
            );
            return Err(PulseError::Guardrail {
                rule: "rate_limit_exceeded".into(),
                reason: format!(
                    "{}/{} mutations in the last hour",
                    self.mutation_timestamps.len(),
                    self.cfg.max_mutations_per_hour
                ),
            });
        }
        self.mutation_timestamps.push(now);
        Ok(())
    }

    /// Clamp a weight change: delta bounded per call, then range-clamped to
    /// the drive's floor and the global ceiling. Returns the value to apply.
    pub fn clamp_weight(&self, current: f64, proposed: f64, protected: bool) -> f64 {
        let delta = proposed - current;
        let bounded = if delta.abs() > self.cfg.max_weight_delta {
            current + self.cfg.max_weight_delta * delta.signum()
        } else {
            proposed
        };
        let floor = if protected {
            self.cfg.protected_min_weight
        } else {
            self.cfg.min_weight
        };
        bounded.clamp(floor, self.cfg.max_weight)
    }

    pub fn validate_threshold(&self, value: f64) -> pulse_core::Result<()> {
        if value < self.cfg.min_trigger_threshold || value > self.cfg.max_trigger_threshold {
            return Err(PulseError::Guardrail {
                rule: "threshold_range".into(),
                reason: format!(
                    "{value} outside [{}, {}]",
                    self.cfg.min_trigger_threshold, self.cfg.max_trigger_threshold
                ),
            });
        }
        Ok(())
    }

    pub fn validate_rate(&self, value: f64) -> pulse_core::Result<()> {
        if value < self.cfg.min_pressure_rate || value > self.cfg.max_pressure_rate {
            return Err(PulseError::Guardrail {
                rule: "rate_range".into(),
                reason: format!(
                    "{value} outside [{}, {}]",
                    self.cfg.min_pressure_rate, self.cfg.max_pressure_rate
                ),
            });
        }
        Ok(())
    }

    pub fn validate_cooldown(&self, value: u64) -> pulse_core::Result<()> {
        if value < self.cfg.min_cooldown_secs || value > self.cfg.max_cooldown_secs {
            return Err(PulseError::Guardrail {
                rule: "cooldown_range".into(),
                reason: format!(
                    "{value}s outside [{}s, {}s]",
                    self.cfg.min_cooldown_secs, self.cfg.max_cooldown_secs
                ),
            });
        }
        Ok(())
    }

    pub fn validate_turns_per_hour(&self, value: u32) -> pulse_core::Result<()> {
        if value < self.cfg.min_turns_per_hour || value > self.cfg.max_turns_per_hour {
            return Err(PulseError::Guardrail {
                rule: "turns_per_hour_range".into(),
                reason: format!(
                    "{value} outside [{}, {}]",
                    self.cfg.min_turns_per_hour, self.cfg.max_turns_per_hour
                ),
            });
        }
        Ok(())
    }

    pub fn validate_manual_delta(&self, amount: f64) -> pulse_core::Result<()> {
        if !amount.is_finite() || amount.abs() > self.cfg.max_manual_delta {
            return Err(PulseError::Guardrail {
                rule: "manual_delta".into(),
                reason: format!("|{amount}| exceeds {}", self.cfg.max_manual_delta),
            });
        }
        Ok(())
    }

    pub fn validate_drive_removal(&self, name: &str, protected: bool) -> pulse_core::Result<()> {
        if protected || self.cfg.protected_drives.iter().any(|d| d == name) {
            return Err(PulseError::Guardrail {
                rule: "protected_drive".into(),
                reason: format!("cannot remove protected drive '{name}'"),
            });
        }
        Ok(())
    }

    pub fn validate_drive_addition(
        &self,
        name: &str,
        already_exists: bool,
        current_count: usize,
    ) -> pulse_core::Result<()> {
        if name.trim().is_empty() {
            return Err(PulseError::Guardrail {
                rule: "empty_name".into(),
                reason: "drive name must not be empty".into(),
            });
        }
        if already_exists {
            return Err(PulseError::Guardrail {
                rule: "already_exists".into(),
                reason: format!("drive '{name}' already exists"),
            });
        }
        if current_count >= self.cfg.max_drives {
            return Err(PulseError::Guardrail {
                rule: "max_drives".into(),
                reason: format!("at limit ({current_count}/{})", self.cfg.max_drives),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrails() -> Guardrails {
        Guardrails::new(GuardrailConfig::default(), Vec::new(), 0.0)
    }

    #[test]
    fn weight_delta_is_bounded_per_call() {
        let g = guardrails();
        assert!((g.clamp_weight(1.0, 2.0, false) - 1.1).abs() < 1e-9);
        assert!((g.clamp_weight(1.0, 0.2, false) - 0.9).abs() < 1e-9);
        assert!((g.clamp_weight(1.0, 1.05, false) - 1.05).abs() < 1e-9);
    }

    #[test]
    fn weight_clamps_to_protected_floor() {
        let g = guardrails();
        // Delta bound takes 0.55 → 0.45, then the protected floor lifts it to 0.5.
        assert!((g.clamp_weight(0.55, 0.1, true) - 0.5).abs() < 1e-9);
        assert!((g.clamp_weight(0.1, 0.01, false) - 0.05).abs() < 1e-9);
    }

    #[test]
    fn threshold_range_rejects_outside() {
        let g = guardrails();
        assert!(g.validate_threshold(5.0).is_ok());
        assert!(g.validate_threshold(0.4).is_err());
        assert!(g.validate_threshold(50.1).is_err());
        let err = g.validate_threshold(100.0).unwrap_err();
        assert_eq!(err.rule(), Some("threshold_range"));
    }

    #[test]
    fn rate_cooldown_turns_ranges() {
        let g = guardrails();
        assert!(g.validate_rate(0.02).is_ok());
        assert!(g.validate_rate(0.0001).is_err());
        assert!(g.validate_cooldown(300).is_ok());
        assert!(g.validate_cooldown(59).is_err());
        assert!(g.validate_cooldown(7201).is_err());
        assert!(g.validate_turns_per_hour(10).is_ok());
        assert!(g.validate_turns_per_hour(0).is_err());
        assert!(g.validate_turns_per_hour(61).is_err());
    }

    #[test]
    fn manual_delta_bound() {
        let g = guardrails();
        assert!(g.validate_manual_delta(1.5).is_ok());
        assert!(g.validate_manual_delta(-1.5).is_ok());
        assert!(g.validate_manual_delta(2.5).is_err());
        assert!(g.validate_manual_delta(f64::NAN).is_err());
    }

    #[test]
    fn protected_drives_cannot_be_removed() {
        let g = guardrails();
        assert!(g.validate_drive_removal("goals", false).is_err());
        assert!(g.validate_drive_removal("anything", true).is_err());
        assert!(g.validate_drive_removal("writing", false).is_ok());
    }

    #[test]
    fn addition_rules() {
        let g = guardrails();
        assert!(g.validate_drive_addition("writing", false, 3).is_ok());
        assert!(g.validate_drive_addition("", false, 3).is_err());
        assert!(g.validate_drive_addition("writing", true, 3).is_err());
        assert!(g.validate_drive_addition("writing", false, 15).is_err());
    }

    #[test]
    fn rate_limit_counts_attempts_within_hour() {
        let mut g = guardrails();
        for i in 0..10 {
            assert!(g.check_mutation_rate(i as f64).is_ok());
        }
        let err = g.check_mutation_rate(11.0).unwrap_err();
        assert_eq!(err.rule(), Some("rate_limit_exceeded"));
        // An hour later the window has rolled.
        assert!(g.check_mutation_rate(3700.0).is_ok());
    }

    #[test]
    fn rate_limit_window_survives_restart() {
        let mut g = guardrails();
        for i in 0..10 {
            g.check_mutation_rate(i as f64).unwrap();
        }
        let persisted: Vec<f64> = g.mutation_timestamps().to_vec();

        // "Restart" one minute later: the persisted window still blocks.
        let mut g2 = Guardrails::new(GuardrailConfig::default(), persisted, 60.0);
        assert!(g2.check_mutation_rate(60.0).is_err());
    }

    #[test]
    fn stale_timestamps_are_pruned_on_restore() {
        let old: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let mut g = Guardrails::new(GuardrailConfig::default(), old, 4000.0);
        assert!(g.check_mutation_rate(4000.0).is_ok());
    }
}
