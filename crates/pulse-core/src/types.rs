use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ── Drives ─────────────────────────────────────────────────────

/// A single drive — a named motivational channel with accumulating pressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub name: String,
    /// Multiplier on pressure accumulation and evaluation contribution.
    pub weight: f64,
    /// Current accumulated urgency, clamped to `[0, max_pressure]`.
    pub pressure: f64,
    /// Epoch seconds of the most recent successful feedback naming this drive.
    #[serde(default)]
    pub last_addressed: f64,
    /// Source descriptors (file paths or sensor keys) whose changes spike this drive.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Protected drives cannot be removed and have a higher weight floor.
    #[serde(default)]
    pub protected: bool,
    /// Epoch seconds when a mutation created this drive; 0 for config drives.
    #[serde(default)]
    pub created_at: f64,
}

impl Drive {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            pressure: 0.0,
            last_addressed: 0.0,
            sources: Vec::new(),
            protected: false,
            created_at: 0.0,
        }
    }

    pub fn weighted_pressure(&self) -> f64 {
        self.pressure * self.weight
    }
}

/// Snapshot of all drives at a point in time, as seen by the evaluator.
/// Drive order is the engine's insertion order — ties on weighted pressure
/// are broken by that order, so `top_drive` is deterministic.
#[derive(Debug, Clone, Serialize)]
pub struct DriveState {
    pub drives: Vec<Drive>,
    pub timestamp: f64,
    pub total_pressure: f64,
    pub top_drive: Option<Drive>,
}

impl DriveState {
    pub fn new(drives: Vec<Drive>, timestamp: f64) -> Self {
        let total_pressure = drives.iter().map(|d| d.weighted_pressure()).sum();
        // Strictly-greater comparison keeps the earliest-inserted drive on ties.
        let mut top: Option<&Drive> = None;
        for d in &drives {
            if top.is_none_or(|t| d.weighted_pressure() > t.weighted_pressure()) {
                top = Some(d);
            }
        }
        let top_drive = top.cloned();
        Self {
            drives,
            timestamp,
            total_pressure,
            top_drive,
        }
    }

    /// Highest individual weighted pressure, 0.0 when there are no drives.
    pub fn max_individual_pressure(&self) -> f64 {
        self.top_drive
            .as_ref()
            .map(|d| d.weighted_pressure())
            .unwrap_or(0.0)
    }
}

// ── Trigger decisions ──────────────────────────────────────────

/// The evaluator's verdict for one loop iteration.
#[derive(Debug, Clone)]
pub struct TriggerDecision {
    pub should_trigger: bool,
    pub reason: String,
    /// Name + weighted pressure of the single highest-pressure drive,
    /// snapshotted at decision time.
    pub top_drive: Option<TopDrive>,
    pub total_pressure: f64,
    /// Short free-form summary of what the sensors saw; may be empty.
    pub sensor_context: String,
    /// Evaluator-requested cooldown before the next decision.
    pub suppress_for: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopDrive {
    pub name: String,
    pub pressure: f64,
}

impl TriggerDecision {
    pub fn no_trigger(reason: impl Into<String>, state: &DriveState) -> Self {
        Self {
            should_trigger: false,
            reason: reason.into(),
            top_drive: state.top_drive.as_ref().map(TopDrive::from),
            total_pressure: state.total_pressure,
            sensor_context: String::new(),
            suppress_for: None,
        }
    }

    pub fn trigger(reason: impl Into<String>, state: &DriveState) -> Self {
        Self {
            should_trigger: true,
            reason: reason.into(),
            top_drive: state.top_drive.as_ref().map(TopDrive::from),
            total_pressure: state.total_pressure,
            sensor_context: String::new(),
            suppress_for: None,
        }
    }
}

impl From<&Drive> for TopDrive {
    fn from(d: &Drive) -> Self {
        Self {
            name: d.name.clone(),
            pressure: d.weighted_pressure(),
        }
    }
}

// ── Mutations ──────────────────────────────────────────────────

/// A self-modification command submitted by the agent, either through the
/// `mutations.json` queue file or `POST /config`. The schema is closed:
/// unknown mutation types and unknown fields fail [`Mutation::parse`] and
/// surface as rejected audit entries. Always go through `parse` — serde's
/// `deny_unknown_fields` is inert on internally tagged enums, so the field
/// whitelist lives there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    AdjustWeight {
        drive: String,
        value: f64,
        #[serde(default)]
        reason: String,
    },
    AdjustThreshold {
        value: f64,
        #[serde(default)]
        reason: String,
    },
    AdjustRate {
        value: f64,
        #[serde(default)]
        reason: String,
    },
    AdjustCooldown {
        value: u64,
        #[serde(default)]
        reason: String,
    },
    AdjustTurnsPerHour {
        value: u32,
        #[serde(default)]
        reason: String,
    },
    AddDrive {
        name: String,
        #[serde(default = "default_new_drive_weight")]
        weight: f64,
        #[serde(default)]
        sources: Vec<String>,
        #[serde(default)]
        reason: String,
    },
    RemoveDrive {
        drive: String,
        #[serde(default)]
        reason: String,
    },
    SpikeDrive {
        drive: String,
        #[serde(default = "default_manual_amount")]
        amount: f64,
        #[serde(default)]
        reason: String,
    },
    DecayDrive {
        drive: String,
        #[serde(default = "default_manual_amount")]
        amount: f64,
        #[serde(default)]
        reason: String,
    },
}

fn default_new_drive_weight() -> f64 {
    0.5
}

fn default_manual_amount() -> f64 {
    0.3
}

impl Mutation {
    /// Validating parse from a raw queue/HTTP value. Rejects non-objects,
    /// unknown mutation types, and unknown fields.
    pub fn parse(value: &serde_json::Value) -> std::result::Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "mutation must be a JSON object".to_string())?;
        let kind = obj
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| "missing 'type' field".to_string())?;
        let allowed: &[&str] = match kind {
            "adjust_weight" => &["type", "drive", "value", "reason"],
            "adjust_threshold" | "adjust_rate" | "adjust_cooldown" | "adjust_turns_per_hour" => {
                &["type", "value", "reason"]
            }
            "add_drive" => &["type", "name", "weight", "sources", "reason"],
            "remove_drive" => &["type", "drive", "reason"],
            "spike_drive" | "decay_drive" => &["type", "drive", "amount", "reason"],
            other => return Err(format!("unknown mutation type '{other}'")),
        };
        for key in obj.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(format!("unknown field '{key}' for mutation '{kind}'"));
            }
        }
        serde_json::from_value(value.clone()).map_err(|e| e.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::AdjustWeight { .. } => "adjust_weight",
            Mutation::AdjustThreshold { .. } => "adjust_threshold",
            Mutation::AdjustRate { .. } => "adjust_rate",
            Mutation::AdjustCooldown { .. } => "adjust_cooldown",
            Mutation::AdjustTurnsPerHour { .. } => "adjust_turns_per_hour",
            Mutation::AddDrive { .. } => "add_drive",
            Mutation::RemoveDrive { .. } => "remove_drive",
            Mutation::SpikeDrive { .. } => "spike_drive",
            Mutation::DecayDrive { .. } => "decay_drive",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Mutation::AdjustWeight { reason, .. }
            | Mutation::AdjustThreshold { reason, .. }
            | Mutation::AdjustRate { reason, .. }
            | Mutation::AdjustCooldown { reason, .. }
            | Mutation::AdjustTurnsPerHour { reason, .. }
            | Mutation::AddDrive { reason, .. }
            | Mutation::RemoveDrive { reason, .. }
            | Mutation::SpikeDrive { reason, .. }
            | Mutation::DecayDrive { reason, .. } => reason,
        }
    }
}

// ── Runtime-mutable config subset ──────────────────────────────

/// The slice of config that mutations may rewrite at runtime. Persisted as
/// `config_overrides` so the agent's adjustments survive restarts. Shared
/// between the mutator (writer) and the evaluator/daemon (readers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunables {
    pub trigger_threshold: f64,
    pub pressure_rate: f64,
    pub min_trigger_interval_secs: u64,
    pub max_turns_per_hour: u32,
}

pub type SharedTunables = std::sync::Arc<parking_lot::RwLock<Tunables>>;

// ── Audit entries ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    Rejected,
}

/// One line in the append-only audit log: an applied or rejected mutation
/// with a before/after snapshot of the affected field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: f64,
    pub kind: String,
    /// What was changed, e.g. `drives.curiosity.weight`.
    pub target: String,
    pub params: serde_json::Value,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub outcome: AuditOutcome,
    /// The guardrail rule that blocked a rejected mutation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// The agent's stated reason, recorded verbatim.
    pub reason: String,
}

// ── Trigger history ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerHistoryEntry {
    pub timestamp: f64,
    pub reason: String,
    pub top_drive: Option<String>,
    pub total_pressure: f64,
    /// "202", "4xx", "5xx", "timeout", "transport", ...
    pub webhook_status: String,
    pub dispatched_turn_id: Option<String>,
}

// ── Feedback ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Success,
    Partial,
    Failure,
}

/// The agent's post-hoc report of which drives its turn addressed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub drives_addressed: Vec<String>,
    pub outcome: FeedbackOutcome,
    #[serde(default)]
    pub summary: String,
    /// Optional per-drive absolute decay amounts, overriding the
    /// outcome-based default.
    #[serde(default)]
    pub decay_overrides: HashMap<String, f64>,
}

/// Per-drive before/after pressures returned from feedback application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub before: f64,
    pub after: f64,
    pub decayed: f64,
}

// ── Sensor readings ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemAlert {
    pub kind: String,
    pub detail: String,
    pub severity: AlertSeverity,
}

/// An explicit pressure spike requested by sensor logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeDirective {
    pub drive: String,
    pub delta: f64,
    /// Which sensor or source produced this directive.
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FilesystemReading {
    pub changes: Vec<FileChange>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationReading {
    pub active: bool,
    pub in_cooldown: bool,
    pub seconds_since_last_message: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemReading {
    pub alerts: Vec<SystemAlert>,
    /// True when a health command timed out and this reading is stale.
    pub stale: bool,
}

/// Combined output of one sensor sweep, consumed by the drive engine and
/// the evaluator. Sensors never mutate drive state directly — everything
/// flows through this value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorSnapshot {
    pub timestamp: f64,
    pub filesystem: FilesystemReading,
    pub conversation: ConversationReading,
    pub system: SystemReading,
    pub spikes: Vec<SpikeDirective>,
}

impl SensorSnapshot {
    /// Short human summary for trigger messages and model prompts.
    pub fn context_line(&self) -> String {
        let mut parts = Vec::new();
        if !self.filesystem.changes.is_empty() {
            parts.push(format!("{} file changes", self.filesystem.changes.len()));
        }
        if self.conversation.active {
            parts.push("conversation active".to_string());
        }
        if !self.system.alerts.is_empty() {
            parts.push(format!("{} system alerts", self.system.alerts.len()));
        }
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_state_picks_top_by_weighted_pressure() {
        let mut a = Drive::new("goals", 1.0);
        a.pressure = 2.0;
        let mut b = Drive::new("curiosity", 2.0);
        b.pressure = 1.5;
        let state = DriveState::new(vec![a, b], 0.0);
        assert_eq!(state.top_drive.as_ref().unwrap().name, "curiosity");
        assert!((state.total_pressure - 5.0).abs() < 1e-9);
    }

    #[test]
    fn drive_state_breaks_ties_by_insertion_order() {
        let mut a = Drive::new("first", 1.0);
        a.pressure = 3.0;
        let mut b = Drive::new("second", 1.0);
        b.pressure = 3.0;
        let state = DriveState::new(vec![a, b], 0.0);
        assert_eq!(state.top_drive.as_ref().unwrap().name, "first");
    }

    #[test]
    fn mutation_parses_from_queue_format() {
        let raw: serde_json::Value = serde_json::json!({
            "type": "adjust_weight",
            "drive": "curiosity",
            "value": 0.8,
            "reason": "explore more"
        });
        let m = Mutation::parse(&raw).unwrap();
        assert_eq!(m.kind(), "adjust_weight");
        assert_eq!(m.reason(), "explore more");
    }

    #[test]
    fn mutation_rejects_unknown_fields() {
        let raw = serde_json::json!({
            "type": "adjust_threshold",
            "value": 2.0,
            "disable_guardrails": true
        });
        assert!(Mutation::parse(&raw).is_err());
    }

    #[test]
    fn mutation_rejects_unknown_type() {
        let raw = serde_json::json!({"type": "rm_audit_log"});
        assert!(Mutation::parse(&raw).is_err());
    }

    #[test]
    fn mutation_rejects_non_object() {
        assert!(Mutation::parse(&serde_json::json!("spike everything")).is_err());
    }

    #[test]
    fn mutation_defaults_optional_fields() {
        let raw = serde_json::json!({"type": "spike_drive", "drive": "goals"});
        let m = Mutation::parse(&raw).unwrap();
        match m {
            Mutation::SpikeDrive { amount, .. } => assert_eq!(amount, 0.3),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
