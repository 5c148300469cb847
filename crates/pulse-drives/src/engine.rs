use std::collections::HashMap;
use tracing::{debug, info, warn};

use pulse_config::PulseConfig;
use pulse_core::{
    AlertSeverity, Drive, DriveState, Feedback, FeedbackOutcome, FeedbackResult, PulseError,
    SensorSnapshot, TriggerDecision,
};

/// Manages all drives and their pressure accumulation.
///
/// Drives live in insertion order — the order decides ties on weighted
/// pressure, so it is part of the engine's observable behavior and is
/// preserved across snapshot/restore.
pub struct DriveEngine {
    drives: Vec<Drive>,
    pressure_rate: f64,
    max_pressure: f64,
    success_decay: f64,
    failure_boost: f64,
    proportional_decay_scale: f64,
    adaptive_decay: bool,
    min_weight: f64,
    max_weight: f64,
    protected_min_weight: f64,
    /// Cooldown gate for system-alert spikes (epoch seconds).
    system_spike_cooldown_secs: f64,
    pub total_triggers: u64,
    pub last_tick_at: f64,
}

impl DriveEngine {
    /// Build the engine from config categories. "goals" and "growth" are
    /// protected even when the config forgets to say so.
    pub fn from_config(config: &PulseConfig) -> Self {
        let mut drives = Vec::new();
        for (name, cat) in &config.drives.categories {
            drives.push(Drive {
                name: name.clone(),
                weight: cat.weight,
                pressure: 0.0,
                last_addressed: 0.0,
                sources: cat.sources.clone(),
                protected: config.is_protected_drive(name),
                created_at: 0.0,
            });
        }
        Self {
            drives,
            pressure_rate: config.drives.pressure_rate,
            max_pressure: config.drives.max_pressure,
            success_decay: config.drives.success_decay,
            failure_boost: config.drives.failure_boost,
            proportional_decay_scale: config.drives.proportional_decay_scale,
            adaptive_decay: config.drives.adaptive_decay,
            min_weight: config.guardrails.min_weight,
            max_weight: config.guardrails.max_weight,
            protected_min_weight: config.guardrails.protected_min_weight,
            system_spike_cooldown_secs: config.webhook.min_trigger_interval_secs as f64,
            total_triggers: 0,
            last_tick_at: 0.0,
        }
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<&Drive> {
        self.drives.iter().find(|d| d.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Drive> {
        self.drives.iter_mut().find(|d| d.name == name)
    }

    pub fn len(&self) -> usize {
        self.drives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drives.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Drive> {
        self.drives.iter()
    }

    /// Runtime value of the mutable rate (mutations adjust it).
    pub fn pressure_rate(&self) -> f64 {
        self.pressure_rate
    }

    pub fn set_pressure_rate(&mut self, rate: f64) {
        self.pressure_rate = rate;
    }

    pub fn success_decay(&self) -> f64 {
        self.success_decay
    }

    fn weight_floor(&self, protected: bool) -> f64 {
        if protected {
            self.protected_min_weight
        } else {
            self.min_weight
        }
    }

    fn clamp_pressure(&self, p: f64) -> f64 {
        p.clamp(0.0, self.max_pressure)
    }

    // ── Tick ───────────────────────────────────────────────────

    /// Advance all drives by `dt_secs` and apply sensor effects.
    /// `pressure_rate` is per minute; `dt` is seconds.
    pub fn tick(&mut self, dt_secs: f64, sensors: &SensorSnapshot, now: f64) -> DriveState {
        let dt = dt_secs.max(0.0);
        self.last_tick_at = now;

        let rate = self.pressure_rate;
        let max = self.max_pressure;
        for drive in &mut self.drives {
            drive.pressure =
                (drive.pressure + rate * (dt / 60.0) * drive.weight).clamp(0.0, max);
        }

        self.apply_sensor_effects(sensors, now);

        DriveState::new(self.drives.clone(), now)
    }

    /// Sensor-driven spikes: explicit directives first, then the ambient
    /// filesystem/system signals.
    fn apply_sensor_effects(&mut self, sensors: &SensorSnapshot, now: f64) {
        for directive in &sensors.spikes {
            let max = self.max_pressure;
            if let Some(drive) = self.get_mut(&directive.drive) {
                drive.pressure = (drive.pressure + directive.delta).clamp(0.0, max);
                debug!(
                    drive = %directive.drive,
                    delta = directive.delta,
                    source = %directive.source,
                    "sensor spike applied"
                );
            } else {
                debug!(drive = %directive.drive, "spike directive for unknown drive ignored");
            }
        }

        // File changes nudge the goals drive.
        if !sensors.filesystem.changes.is_empty() {
            let max = self.max_pressure;
            if let Some(goals) = self.get_mut("goals") {
                goals.pressure = (goals.pressure + 0.1).clamp(0.0, max);
            }
        }

        // High-severity system alerts spike the on-demand system drive, at
        // most once per cooldown window and only while its pressure is low,
        // so a persistent alert cannot ratchet pressure unbounded.
        let high_alerts = sensors
            .system
            .alerts
            .iter()
            .any(|a| a.severity == AlertSeverity::High);
        if high_alerts {
            self.spike_system_drive(0.5, now);
        }
    }

    /// Spike the `system` drive, creating it (weight 1.5) if absent.
    pub fn spike_system_drive(&mut self, delta: f64, now: f64) {
        if self.get("system").is_none() {
            let mut d = Drive::new("system", 1.5);
            d.created_at = now;
            self.drives.push(d);
            info!("system drive created on demand");
        }
        let cooldown = self.system_spike_cooldown_secs;
        let max = self.max_pressure;
        if let Some(drive) = self.get_mut("system") {
            let since_addressed = now - drive.last_addressed;
            if since_addressed > cooldown && drive.pressure < 1.0 {
                drive.pressure = (drive.pressure + delta).clamp(0.0, max);
                debug!(pressure = drive.pressure, "system drive spiked");
            }
        }
    }

    // ── Feedback & decay ───────────────────────────────────────

    /// Apply agent feedback. Named drives get the full outcome-based decay
    /// factor (success = `success_decay`, partial = half, failure = none),
    /// or an absolute override amount when one is given. Other drives with
    /// pressure decay proportionally to their share of total pressure, so a
    /// secondary drive cannot immediately re-trigger. Names that no longer
    /// exist no-op silently.
    pub fn apply_feedback(&mut self, feedback: &Feedback, now: f64) -> HashMap<String, FeedbackResult> {
        let mut factor = match feedback.outcome {
            FeedbackOutcome::Success => self.success_decay,
            FeedbackOutcome::Partial => self.success_decay / 2.0,
            FeedbackOutcome::Failure => 0.0,
        };
        let total: f64 = self.drives.iter().map(|d| d.weighted_pressure()).sum();

        if self.adaptive_decay && total > 5.0 && factor > 0.0 {
            factor = (factor * (total / 5.0).min(3.0)).min(1.0);
        }

        let shares: HashMap<String, f64> = if total > 0.0 {
            self.drives
                .iter()
                .map(|d| (d.name.clone(), d.weighted_pressure() / total))
                .collect()
        } else {
            HashMap::new()
        };

        let mut results = HashMap::new();
        let scale = self.proportional_decay_scale;
        for drive in &mut self.drives {
            let named = feedback.drives_addressed.contains(&drive.name);
            let before = drive.pressure;

            let decay_amount = if named {
                if let Some(&amount) = feedback.decay_overrides.get(&drive.name) {
                    amount.max(0.0).min(drive.pressure)
                } else {
                    drive.pressure * factor
                }
            } else if factor > 0.0 && drive.pressure > 0.0 {
                let share = shares.get(&drive.name).copied().unwrap_or(0.0);
                (drive.pressure * factor * share * scale).min(drive.pressure)
            } else {
                0.0
            };

            drive.pressure = (drive.pressure - decay_amount).max(0.0);
            if named {
                drive.last_addressed = now;
                results.insert(
                    drive.name.clone(),
                    FeedbackResult {
                        before,
                        after: drive.pressure,
                        decayed: decay_amount,
                    },
                );
            }
        }
        results
    }

    /// Called after a failed webhook dispatch: the top drive gets a
    /// frustration boost instead of relief.
    pub fn on_trigger_failure(&mut self, decision: &TriggerDecision) {
        let boost = self.failure_boost;
        let max = self.max_pressure;
        if let Some(top) = decision.top_drive.as_ref() {
            if let Some(drive) = self.get_mut(&top.name) {
                drive.pressure = (drive.pressure + boost).clamp(0.0, max);
                warn!(
                    drive = %drive.name,
                    pressure = drive.pressure,
                    "drive boosted after failed trigger"
                );
            }
        }
    }

    pub fn record_trigger(&mut self) {
        self.total_triggers += 1;
    }

    // ── Manual adjustments (mutation path) ─────────────────────

    pub fn spike(&mut self, name: &str, delta: f64) -> pulse_core::Result<(f64, f64)> {
        let max = self.max_pressure;
        let drive = self
            .get_mut(name)
            .ok_or_else(|| PulseError::DriveNotFound(name.to_string()))?;
        let before = drive.pressure;
        drive.pressure = (drive.pressure + delta).clamp(0.0, max);
        Ok((before, drive.pressure))
    }

    pub fn decay(&mut self, name: &str, delta: f64) -> pulse_core::Result<(f64, f64)> {
        let drive = self
            .get_mut(name)
            .ok_or_else(|| PulseError::DriveNotFound(name.to_string()))?;
        let before = drive.pressure;
        drive.pressure = (drive.pressure - delta).max(0.0);
        Ok((before, drive.pressure))
    }

    /// Set a weight, clamped to the drive's floor and the global ceiling.
    /// Range enforcement beyond clamping is the guardrail layer's job — a
    /// rejected mutation must never land here.
    pub fn set_weight(&mut self, name: &str, value: f64) -> pulse_core::Result<(f64, f64)> {
        let min_weight = self.min_weight;
        let protected_min = self.protected_min_weight;
        let ceiling = self.max_weight;
        let drive = self
            .get_mut(name)
            .ok_or_else(|| PulseError::DriveNotFound(name.to_string()))?;
        let floor = if drive.protected {
            protected_min
        } else {
            min_weight
        };
        let before = drive.weight;
        drive.weight = value.clamp(floor, ceiling);
        Ok((before, drive.weight))
    }

    pub fn add_drive(
        &mut self,
        name: &str,
        weight: f64,
        sources: Vec<String>,
        now: f64,
    ) -> pulse_core::Result<()> {
        if name.is_empty() {
            return Err(PulseError::Validation("drive name must not be empty".into()));
        }
        if self.get(name).is_some() {
            return Err(PulseError::DriveExists(name.to_string()));
        }
        let floor = self.weight_floor(false);
        let mut drive = Drive::new(name, weight.clamp(floor, self.max_weight));
        drive.sources = sources;
        drive.created_at = now;
        self.drives.push(drive);
        info!(drive = name, weight, "drive added");
        Ok(())
    }

    /// Remove a non-protected drive. Protection is also checked by the
    /// guardrail layer; this is the engine-side invariant.
    pub fn remove_drive(&mut self, name: &str) -> pulse_core::Result<Drive> {
        let idx = self
            .drives
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| PulseError::DriveNotFound(name.to_string()))?;
        if self.drives[idx].protected {
            return Err(PulseError::Guardrail {
                rule: "protected_drive".into(),
                reason: format!("cannot remove protected drive '{name}'"),
            });
        }
        let removed = self.drives.remove(idx);
        info!(drive = name, "drive removed");
        Ok(removed)
    }

    // ── Snapshot / restore ─────────────────────────────────────

    /// Ordered snapshot for persistence and the `/state` endpoint.
    pub fn snapshot(&self) -> Vec<Drive> {
        self.drives.clone()
    }

    pub fn drive_state(&self, now: f64) -> DriveState {
        DriveState::new(self.drives.clone(), now)
    }

    /// Overlay a persisted snapshot onto the config-built engine. Drives
    /// missing from the snapshot keep their config defaults; runtime-added
    /// drives are recreated; all values are re-clamped on the way in.
    pub fn restore(&mut self, snapshot: Vec<Drive>) {
        let mut restored = 0usize;
        for saved in snapshot {
            let max_pressure = self.max_pressure;
            let max_weight = self.max_weight;
            let protected_min_weight = self.protected_min_weight;
            let min_weight = self.min_weight;
            match self.get_mut(&saved.name) {
                Some(existing) => {
                    existing.pressure = saved.pressure.clamp(0.0, max_pressure);
                    let floor = if existing.protected {
                        protected_min_weight
                    } else {
                        min_weight
                    };
                    existing.weight = saved.weight.clamp(floor, max_weight);
                    existing.last_addressed = saved.last_addressed;
                    restored += 1;
                }
                None => {
                    let mut drive = saved;
                    drive.pressure = drive.pressure.clamp(0.0, self.max_pressure);
                    let floor = self.weight_floor(drive.protected);
                    drive.weight = drive.weight.clamp(floor, self.max_weight);
                    info!(drive = %drive.name, weight = drive.weight, "restored runtime drive");
                    self.drives.push(drive);
                    restored += 1;
                }
            }
        }
        debug!(restored, "drive state restored");
    }
}
