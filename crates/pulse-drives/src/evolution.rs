use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::info;

use crate::engine::DriveEngine;
use pulse_config::PulseConfig;

const MAX_RECORDS_PER_DRIVE: usize = 50;

/// One trigger outcome attributed to a drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub success: bool,
    /// 0.0–1.0, derived from the feedback outcome.
    pub quality: f64,
}

/// Rolling per-drive outcome history feeding weight evolution.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PerformanceTracker {
    history: HashMap<String, VecDeque<EvaluationRecord>>,
}

/// Aggregate view over a drive's recent history. With no data everything
/// reads neutral (0.5) so evolution leaves unknown drives alone.
#[derive(Debug, Clone, Copy)]
pub struct DrivePerformance {
    pub true_positive_rate: f64,
    pub average_quality: f64,
    pub samples: usize,
}

impl PerformanceTracker {
    pub fn record(&mut self, drive: &str, success: bool, quality: f64) {
        let records = self.history.entry(drive.to_string()).or_default();
        records.push_back(EvaluationRecord {
            success,
            quality: quality.clamp(0.0, 1.0),
        });
        if records.len() > MAX_RECORDS_PER_DRIVE {
            records.pop_front();
        }
    }

    pub fn performance(&self, drive: &str) -> DrivePerformance {
        match self.history.get(drive) {
            Some(records) if !records.is_empty() => {
                let n = records.len() as f64;
                let successes = records.iter().filter(|r| r.success).count() as f64;
                let quality: f64 = records.iter().map(|r| r.quality).sum();
                DrivePerformance {
                    true_positive_rate: successes / n,
                    average_quality: quality / n,
                    samples: records.len(),
                }
            }
            _ => DrivePerformance {
                true_positive_rate: 0.5,
                average_quality: 0.5,
                samples: 0,
            },
        }
    }
}

/// An applied weight adjustment, for the audit trail and `/state`.
#[derive(Debug, Clone, Serialize)]
pub struct WeightChange {
    pub drive: String,
    pub before: f64,
    pub after: f64,
    pub delta: f64,
}

/// Slow weight adaptation: drives whose triggers keep paying off gain
/// weight, drives that keep misfiring lose it — bounded per cycle and run
/// at most every `interval_loops` iterations.
pub struct WeightEvolution {
    enabled: bool,
    interval_loops: u64,
    max_delta_per_cycle: f64,
    loops_since_evolution: u64,
}

impl WeightEvolution {
    pub fn from_config(config: &PulseConfig) -> Self {
        Self {
            enabled: config.evolution.enabled,
            interval_loops: config.evolution.interval_loops.max(1),
            max_delta_per_cycle: config.evolution.max_delta_per_cycle,
            loops_since_evolution: 0,
        }
    }

    /// Called once per main-loop iteration. Returns the changes applied
    /// when an evolution cycle ran.
    pub fn maybe_evolve(
        &mut self,
        engine: &mut DriveEngine,
        tracker: &PerformanceTracker,
    ) -> Option<Vec<WeightChange>> {
        if !self.enabled {
            return None;
        }
        self.loops_since_evolution += 1;
        if self.loops_since_evolution < self.interval_loops {
            return None;
        }
        self.loops_since_evolution = 0;
        Some(self.evolve(engine, tracker))
    }

    fn evolve(&self, engine: &mut DriveEngine, tracker: &PerformanceTracker) -> Vec<WeightChange> {
        let names: Vec<String> = engine.iter().map(|d| d.name.clone()).collect();
        let mut changes = Vec::new();
        for name in names {
            let perf = tracker.performance(&name);
            if perf.samples == 0 {
                continue;
            }
            // Score in [0, 1]; 0.5 is neutral. TP rate dominates, quality refines.
            let score = 0.6 * perf.true_positive_rate + 0.4 * perf.average_quality;
            let delta = ((score - 0.5) * 2.0 * self.max_delta_per_cycle)
                .clamp(-self.max_delta_per_cycle, self.max_delta_per_cycle);
            if delta.abs() < 1e-6 {
                continue;
            }
            let current = match engine.get(&name) {
                Some(d) => d.weight,
                None => continue,
            };
            if let Ok((before, after)) = engine.set_weight(&name, current + delta) {
                if (after - before).abs() > 1e-9 {
                    info!(
                        drive = %name,
                        before,
                        after,
                        tp_rate = perf.true_positive_rate,
                        quality = perf.average_quality,
                        "weight evolved"
                    );
                    changes.push(WeightChange {
                        drive: name,
                        before,
                        after,
                        delta: after - before,
                    });
                }
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> DriveEngine {
        DriveEngine::from_config(&PulseConfig::default())
    }

    fn evolution(interval: u64) -> WeightEvolution {
        let mut config = PulseConfig::default();
        config.evolution.interval_loops = interval;
        WeightEvolution::from_config(&config)
    }

    #[test]
    fn neutral_without_data() {
        let tracker = PerformanceTracker::default();
        let p = tracker.performance("goals");
        assert_eq!(p.true_positive_rate, 0.5);
        assert_eq!(p.average_quality, 0.5);
        assert_eq!(p.samples, 0);
    }

    #[test]
    fn tracker_computes_rates() {
        let mut tracker = PerformanceTracker::default();
        for _ in 0..7 {
            tracker.record("goals", true, 0.8);
        }
        for _ in 0..3 {
            tracker.record("goals", false, 0.1);
        }
        let p = tracker.performance("goals");
        assert!((p.true_positive_rate - 0.7).abs() < 1e-9);
        assert_eq!(p.samples, 10);
    }

    #[test]
    fn evolution_waits_for_interval() {
        let mut evo = evolution(3);
        let mut eng = engine();
        let mut tracker = PerformanceTracker::default();
        tracker.record("goals", true, 1.0);

        assert!(evo.maybe_evolve(&mut eng, &tracker).is_none());
        assert!(evo.maybe_evolve(&mut eng, &tracker).is_none());
        assert!(evo.maybe_evolve(&mut eng, &tracker).is_some());
        // Counter reset — waits again.
        assert!(evo.maybe_evolve(&mut eng, &tracker).is_none());
    }

    #[test]
    fn good_performance_raises_weight() {
        let mut evo = evolution(1);
        let mut eng = engine();
        let before = eng.get("goals").unwrap().weight;
        let mut tracker = PerformanceTracker::default();
        for _ in 0..5 {
            tracker.record("goals", true, 0.9);
        }
        let changes = evo.maybe_evolve(&mut eng, &tracker).unwrap();
        let change = changes.iter().find(|c| c.drive == "goals").unwrap();
        assert!(change.after > before);
    }

    #[test]
    fn poor_performance_lowers_weight() {
        let mut evo = evolution(1);
        let mut eng = engine();
        let before = eng.get("curiosity").unwrap().weight;
        let mut tracker = PerformanceTracker::default();
        for _ in 0..5 {
            tracker.record("curiosity", false, 0.1);
        }
        let changes = evo.maybe_evolve(&mut eng, &tracker).unwrap();
        let change = changes.iter().find(|c| c.drive == "curiosity").unwrap();
        assert!(change.after < before);
    }

    #[test]
    fn delta_is_bounded_per_cycle() {
        let mut evo = evolution(1);
        let mut eng = engine();
        let mut tracker = PerformanceTracker::default();
        for _ in 0..20 {
            tracker.record("goals", true, 1.0);
        }
        let changes = evo.maybe_evolve(&mut eng, &tracker).unwrap();
        for c in changes {
            assert!(c.delta.abs() <= 0.1 + 1e-9);
        }
    }

    #[test]
    fn protected_floor_holds_under_evolution() {
        let mut evo = evolution(1);
        let mut eng = engine();
        let mut tracker = PerformanceTracker::default();
        for _ in 0..20 {
            tracker.record("growth", false, 0.0);
        }
        // Run many cycles — weight must never fall below the protected floor.
        for _ in 0..40 {
            evo.maybe_evolve(&mut eng, &tracker);
        }
        assert!(eng.get("growth").unwrap().weight >= 0.5 - 1e-9);
    }

    #[test]
    fn drives_without_history_are_untouched() {
        let mut evo = evolution(1);
        let mut eng = engine();
        let before = eng.get("curiosity").unwrap().weight;
        let mut tracker = PerformanceTracker::default();
        tracker.record("goals", true, 1.0);
        evo.maybe_evolve(&mut eng, &tracker);
        assert_eq!(eng.get("curiosity").unwrap().weight, before);
    }
}
