use serde_json::{json, Value};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use pulse_core::{AuditEntry, AuditOutcome, Mutation, PulseError, SharedTunables};
use pulse_drives::DriveEngine;
use pulse_state::AuditLog;

use crate::guardrails::Guardrails;

/// Serializes mutation commands, validates them against the guardrails,
/// applies them to the drive engine and tunables, and writes audit entries.
///
/// Intake is two-channel — the `mutations.json` queue file and HTTP
/// submissions — but application is single-threaded: the daemon's main loop
/// is the only caller, and `&mut self` makes racing structurally impossible.
/// The queue file itself is shared with the external agent, so its
/// read-parse-clear cycle runs under an exclusive advisory lock that is
/// released only after the cleared content is durable.
pub struct Mutator {
    guardrails: Guardrails,
    queue_path: PathBuf,
    audit: Arc<AuditLog>,
    tunables: SharedTunables,
}

impl Mutator {
    pub fn new(
        guardrails: Guardrails,
        state_dir: &Path,
        audit: Arc<AuditLog>,
        tunables: SharedTunables,
    ) -> Self {
        Self {
            guardrails,
            queue_path: state_dir.join("mutations.json"),
            audit,
            tunables,
        }
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    pub fn guardrails(&self) -> &Guardrails {
        &self.guardrails
    }

    /// Drain and apply the queue file. Returns one audit entry per queued
    /// item — a malformed item is rejected and the batch continues.
    pub fn drain_queue(&mut self, engine: &mut DriveEngine, now: f64) -> Vec<AuditEntry> {
        let items = match self.take_queue_items() {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "could not read mutation queue");
                return Vec::new();
            }
        };
        if items.is_empty() {
            return Vec::new();
        }
        info!(count = items.len(), "processing mutation queue");
        items
            .into_iter()
            .map(|v| self.apply_value(v, engine, now))
            .collect()
    }

    /// Read and clear the queue under an exclusive file lock. Concurrent
    /// writers (the agent) hold the same lock for their read-merge-write, so
    /// no mutation is lost or applied twice. A queue held by another process
    /// is skipped this tick, not an error.
    fn take_queue_items(&self) -> pulse_core::Result<Vec<Value>> {
        if !self.queue_path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.queue_path)?;
        let mut lock = fd_lock::RwLock::new(file);
        let mut guard = match lock.try_write() {
            Ok(g) => g,
            Err(_) => {
                debug!("mutation queue locked by another process, skipping this tick");
                return Ok(Vec::new());
            }
        };

        let mut raw = String::new();
        guard.read_to_string(&mut raw)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "[]" {
            return Ok(Vec::new());
        }

        let items = match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => items,
            Ok(single) => vec![single],
            Err(e) => {
                // Whole file unparseable: surface one rejected entry and
                // clear it anyway, otherwise it would jam the queue forever.
                warn!(error = %e, "mutation queue is not valid JSON");
                vec![json!({"_raw": trimmed, "_parse_error": e.to_string()})]
            }
        };

        // Clear while still holding the lock; unlock only after the
        // replacement content is durable.
        guard.set_len(0)?;
        guard.seek(SeekFrom::Start(0))?;
        guard.write_all(b"[]")?;
        guard.flush()?;
        guard.sync_all()?;
        Ok(items)
    }

    /// Parse and apply one raw queue item.
    pub fn apply_value(
        &mut self,
        value: Value,
        engine: &mut DriveEngine,
        now: f64,
    ) -> AuditEntry {
        match Mutation::parse(&value) {
            Ok(mutation) => self.apply(mutation, engine, now),
            Err(e) => {
                let kind = value
                    .get("type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let reason = value
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or_default()
                    .to_string();
                warn!(kind = %kind, error = %e, "malformed mutation rejected");
                self.record(AuditEntry {
                    timestamp: now,
                    kind,
                    target: String::new(),
                    params: value,
                    before: Value::Null,
                    after: Value::Null,
                    outcome: AuditOutcome::Rejected,
                    rule: Some("malformed".into()),
                    reason,
                })
            }
        }
    }

    /// Validate and apply a parsed mutation. Validation precedes effect:
    /// the rate limit first, then field/range checks, and only then the
    /// change itself. Exactly one audit entry per call.
    pub fn apply(&mut self, mutation: Mutation, engine: &mut DriveEngine, now: f64) -> AuditEntry {
        let params = serde_json::to_value(&mutation).unwrap_or(Value::Null);
        let kind = mutation.kind().to_string();
        let reason = mutation.reason().to_string();

        if let Err(e) = self.guardrails.check_mutation_rate(now) {
            return self.rejected(now, &kind, "", params, &reason, &e);
        }

        let result = self.dispatch(&mutation, engine, now);
        match result {
            Ok((target, before, after)) => {
                info!(kind = %kind, target = %target, %before, %after, "mutation applied");
                self.record(AuditEntry {
                    timestamp: now,
                    kind,
                    target,
                    params,
                    before,
                    after,
                    outcome: AuditOutcome::Applied,
                    rule: None,
                    reason,
                })
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "mutation rejected");
                let target = String::new();
                self.rejected(now, &kind, &target, params, &reason, &e)
            }
        }
    }

    fn dispatch(
        &mut self,
        mutation: &Mutation,
        engine: &mut DriveEngine,
        now: f64,
    ) -> pulse_core::Result<(String, Value, Value)> {
        match mutation {
            Mutation::AdjustWeight { drive, value, .. } => {
                let current = engine
                    .get(drive)
                    .ok_or_else(|| PulseError::DriveNotFound(drive.clone()))?;
                let validated =
                    self.guardrails
                        .clamp_weight(current.weight, *value, current.protected);
                let (before, after) = engine.set_weight(drive, validated)?;
                Ok((format!("drives.{drive}.weight"), json!(before), json!(after)))
            }
            Mutation::AdjustThreshold { value, .. } => {
                self.guardrails.validate_threshold(*value)?;
                let mut t = self.tunables.write();
                let before = t.trigger_threshold;
                t.trigger_threshold = *value;
                Ok(("drives.trigger_threshold".into(), json!(before), json!(*value)))
            }
            Mutation::AdjustRate { value, .. } => {
                self.guardrails.validate_rate(*value)?;
                let mut t = self.tunables.write();
                let before = t.pressure_rate;
                t.pressure_rate = *value;
                engine.set_pressure_rate(*value);
                Ok(("drives.pressure_rate".into(), json!(before), json!(*value)))
            }
            Mutation::AdjustCooldown { value, .. } => {
                self.guardrails.validate_cooldown(*value)?;
                let mut t = self.tunables.write();
                let before = t.min_trigger_interval_secs;
                t.min_trigger_interval_secs = *value;
                Ok((
                    "webhook.min_trigger_interval_secs".into(),
                    json!(before),
                    json!(*value),
                ))
            }
            Mutation::AdjustTurnsPerHour { value, .. } => {
                self.guardrails.validate_turns_per_hour(*value)?;
                let mut t = self.tunables.write();
                let before = t.max_turns_per_hour;
                t.max_turns_per_hour = *value;
                Ok((
                    "webhook.max_turns_per_hour".into(),
                    json!(before),
                    json!(*value),
                ))
            }
            Mutation::AddDrive {
                name,
                weight,
                sources,
                ..
            } => {
                self.guardrails.validate_drive_addition(
                    name,
                    engine.get(name).is_some(),
                    engine.len(),
                )?;
                let validated = self.guardrails.clamp_weight(*weight, *weight, false);
                engine.add_drive(name, validated, sources.clone(), now)?;
                Ok((
                    format!("drives.{name}"),
                    Value::Null,
                    json!({"name": name, "weight": validated}),
                ))
            }
            Mutation::RemoveDrive { drive, .. } => {
                let target = engine
                    .get(drive)
                    .ok_or_else(|| PulseError::DriveNotFound(drive.clone()))?;
                self.guardrails
                    .validate_drive_removal(drive, target.protected)?;
                let removed = engine.remove_drive(drive)?;
                Ok((
                    format!("drives.{drive}"),
                    json!({"name": removed.name, "weight": removed.weight}),
                    Value::Null,
                ))
            }
            Mutation::SpikeDrive { drive, amount, .. } => {
                self.guardrails.validate_manual_delta(*amount)?;
                let (before, after) = engine.spike(drive, *amount)?;
                Ok((format!("drives.{drive}.pressure"), json!(before), json!(after)))
            }
            Mutation::DecayDrive { drive, amount, .. } => {
                self.guardrails.validate_manual_delta(*amount)?;
                let (before, after) = engine.decay(drive, *amount)?;
                Ok((format!("drives.{drive}.pressure"), json!(before), json!(after)))
            }
        }
    }

    fn rejected(
        &self,
        now: f64,
        kind: &str,
        target: &str,
        params: Value,
        reason: &str,
        err: &PulseError,
    ) -> AuditEntry {
        let rule = match err {
            PulseError::Guardrail { rule, .. } => rule.clone(),
            PulseError::DriveNotFound(_) => "unknown_drive".into(),
            PulseError::DriveExists(_) => "already_exists".into(),
            _ => "validation".into(),
        };
        self.record(AuditEntry {
            timestamp: now,
            kind: kind.to_string(),
            target: target.to_string(),
            params,
            before: Value::Null,
            after: Value::Null,
            outcome: AuditOutcome::Rejected,
            rule: Some(rule),
            reason: reason.to_string(),
        })
    }

    fn record(&self, entry: AuditEntry) -> AuditEntry {
        if let Err(e) = self.audit.record(&entry) {
            error!(error = %e, "failed to write audit entry");
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use pulse_config::schema::GuardrailConfig;
    use pulse_config::PulseConfig;
    use pulse_core::Tunables;

    struct Fixture {
        mutator: Mutator,
        engine: DriveEngine,
        audit: Arc<AuditLog>,
        _dir: tempfile::TempDir,
        queue_path: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path(), 1024 * 1024).unwrap());
        let tunables: SharedTunables = Arc::new(RwLock::new(Tunables {
            trigger_threshold: 5.0,
            pressure_rate: 0.05,
            min_trigger_interval_secs: 300,
            max_turns_per_hour: 10,
        }));
        let guardrails = Guardrails::new(GuardrailConfig::default(), Vec::new(), 0.0);
        let mutator = Mutator::new(guardrails, dir.path(), audit.clone(), tunables);
        let engine = DriveEngine::from_config(&PulseConfig::default());
        let queue_path = mutator.queue_path().to_path_buf();
        Fixture {
            mutator,
            engine,
            audit,
            _dir: dir,
            queue_path,
        }
    }

    #[test]
    fn adjust_threshold_applies_and_audits() {
        let mut fx = fixture();
        let entry = fx.mutator.apply(
            Mutation::AdjustThreshold {
                value: 6.0,
                reason: "raising the bar".into(),
            },
            &mut fx.engine,
            10.0,
        );
        assert_eq!(entry.outcome, AuditOutcome::Applied);
        assert_eq!(entry.before, json!(5.0));
        assert_eq!(entry.after, json!(6.0));
        assert_eq!(entry.reason, "raising the bar");
        assert_eq!(fx.audit.total(), 1);
    }

    #[test]
    fn out_of_range_threshold_is_rejected_not_clamped() {
        let mut fx = fixture();
        let entry = fx.mutator.apply(
            Mutation::AdjustThreshold {
                value: 100.0,
                reason: String::new(),
            },
            &mut fx.engine,
            10.0,
        );
        assert_eq!(entry.outcome, AuditOutcome::Rejected);
        assert_eq!(entry.rule.as_deref(), Some("threshold_range"));
        // The tunable did not move.
        let t = fx.mutator.tunables.read().trigger_threshold;
        assert_eq!(t, 5.0);
    }

    #[test]
    fn weight_adjustment_is_delta_bounded() {
        let mut fx = fixture();
        let entry = fx.mutator.apply(
            Mutation::AdjustWeight {
                drive: "curiosity".into(),
                value: 3.0,
                reason: String::new(),
            },
            &mut fx.engine,
            10.0,
        );
        assert_eq!(entry.outcome, AuditOutcome::Applied);
        // 0.7 + max delta 0.1
        assert!((entry.after.as_f64().unwrap() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn remove_protected_drive_is_rejected() {
        let mut fx = fixture();
        let entry = fx.mutator.apply(
            Mutation::RemoveDrive {
                drive: "goals".into(),
                reason: "too loud".into(),
            },
            &mut fx.engine,
            10.0,
        );
        assert_eq!(entry.outcome, AuditOutcome::Rejected);
        assert_eq!(entry.rule.as_deref(), Some("protected_drive"));
        assert!(fx.engine.get("goals").is_some());
    }

    #[test]
    fn add_then_remove_runtime_drive() {
        let mut fx = fixture();
        let added = fx.mutator.apply(
            Mutation::AddDrive {
                name: "writing".into(),
                weight: 0.7,
                sources: vec!["essays/".into()],
                reason: "I want to write more".into(),
            },
            &mut fx.engine,
            10.0,
        );
        assert_eq!(added.outcome, AuditOutcome::Applied);
        assert!(fx.engine.get("writing").is_some());

        let removed = fx.mutator.apply(
            Mutation::RemoveDrive {
                drive: "writing".into(),
                reason: "done with it".into(),
            },
            &mut fx.engine,
            20.0,
        );
        assert_eq!(removed.outcome, AuditOutcome::Applied);
        assert!(fx.engine.get("writing").is_none());
        assert_eq!(fx.audit.total(), 2);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut fx = fixture();
        let entry = fx.mutator.apply(
            Mutation::AddDrive {
                name: "goals".into(),
                weight: 0.5,
                sources: vec![],
                reason: String::new(),
            },
            &mut fx.engine,
            10.0,
        );
        assert_eq!(entry.outcome, AuditOutcome::Rejected);
        assert_eq!(entry.rule.as_deref(), Some("already_exists"));
    }

    #[test]
    fn oversized_manual_spike_is_rejected() {
        let mut fx = fixture();
        let entry = fx.mutator.apply(
            Mutation::SpikeDrive {
                drive: "goals".into(),
                amount: 5.0,
                reason: String::new(),
            },
            &mut fx.engine,
            10.0,
        );
        assert_eq!(entry.outcome, AuditOutcome::Rejected);
        assert_eq!(entry.rule.as_deref(), Some("manual_delta"));
        assert_eq!(fx.engine.get("goals").unwrap().pressure, 0.0);
    }

    #[test]
    fn eleventh_mutation_in_hour_is_rate_limited() {
        let mut fx = fixture();
        for i in 0..10 {
            let entry = fx.mutator.apply(
                Mutation::SpikeDrive {
                    drive: "goals".into(),
                    amount: 0.1,
                    reason: String::new(),
                },
                &mut fx.engine,
                i as f64,
            );
            assert_eq!(entry.outcome, AuditOutcome::Applied);
        }
        let entry = fx.mutator.apply(
            Mutation::SpikeDrive {
                drive: "goals".into(),
                amount: 0.1,
                reason: String::new(),
            },
            &mut fx.engine,
            10.0,
        );
        assert_eq!(entry.outcome, AuditOutcome::Rejected);
        assert_eq!(entry.rule.as_deref(), Some("rate_limit_exceeded"));
        // Every attempt audited: 10 applied + 1 rejected.
        assert_eq!(fx.audit.total(), 11);
    }

    #[test]
    fn queue_file_drain_applies_in_order() {
        let mut fx = fixture();
        std::fs::write(
            &fx.queue_path,
            r#"[
                {"type": "adjust_threshold", "value": 6.0, "reason": "a"},
                {"type": "adjust_rate", "value": 0.02, "reason": "b"}
            ]"#,
        )
        .unwrap();

        let entries = fx.mutator.drain_queue(&mut fx.engine, 10.0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "adjust_threshold");
        assert_eq!(entries[1].kind, "adjust_rate");
        assert!(entries.iter().all(|e| e.outcome == AuditOutcome::Applied));

        // Queue cleared to an empty array.
        let raw = std::fs::read_to_string(&fx.queue_path).unwrap();
        assert_eq!(raw.trim(), "[]");
        // Draining again is a no-op — consumed exactly once.
        assert!(fx.mutator.drain_queue(&mut fx.engine, 11.0).is_empty());
    }

    #[test]
    fn malformed_item_is_isolated() {
        let mut fx = fixture();
        std::fs::write(
            &fx.queue_path,
            r#"[
                {"type": "warp_reality", "value": 11},
                {"type": "adjust_threshold", "value": 6.0}
            ]"#,
        )
        .unwrap();

        let entries = fx.mutator.drain_queue(&mut fx.engine, 10.0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, AuditOutcome::Rejected);
        assert_eq!(entries[0].rule.as_deref(), Some("malformed"));
        assert_eq!(entries[1].outcome, AuditOutcome::Applied);
        assert_eq!(fx.mutator.tunables.read().trigger_threshold, 6.0);
    }

    #[test]
    fn unparseable_queue_is_cleared_with_one_rejection() {
        let mut fx = fixture();
        std::fs::write(&fx.queue_path, "{{{{not json").unwrap();
        let entries = fx.mutator.drain_queue(&mut fx.engine, 10.0);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Rejected);
        let raw = std::fs::read_to_string(&fx.queue_path).unwrap();
        assert_eq!(raw.trim(), "[]");
    }

    #[test]
    fn missing_queue_file_is_fine() {
        let mut fx = fixture();
        assert!(fx.mutator.drain_queue(&mut fx.engine, 10.0).is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected_per_schema() {
        let mut fx = fixture();
        let entry = fx.mutator.apply_value(
            json!({"type": "adjust_threshold", "value": 6.0, "and_also": "this"}),
            &mut fx.engine,
            10.0,
        );
        assert_eq!(entry.outcome, AuditOutcome::Rejected);
        assert_eq!(entry.rule.as_deref(), Some("malformed"));
    }
}
