use thiserror::Error;

/// Unified error type for the entire Pulse daemon.
#[derive(Error, Debug)]
pub enum PulseError {
    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── State / persistence errors ─────────────────────────────
    #[error("state error: {0}")]
    State(String),

    #[error("state directory locked by another daemon (pid {pid})")]
    StateLocked { pid: u32 },

    // ── Drive engine errors ────────────────────────────────────
    #[error("drive not found: {0}")]
    DriveNotFound(String),

    #[error("drive already exists: {0}")]
    DriveExists(String),

    // ── Sensor errors ──────────────────────────────────────────
    #[error("sensor error: {sensor}: {reason}")]
    Sensor { sensor: String, reason: String },

    // ── Evaluator errors ───────────────────────────────────────
    #[error("evaluator error: {0}")]
    Evaluator(String),

    #[error("model evaluator timed out after {timeout_secs}s")]
    EvaluatorTimeout { timeout_secs: u64 },

    // ── Webhook errors ─────────────────────────────────────────
    #[error("webhook error: {0}")]
    Webhook(String),

    #[error("webhook rejected: HTTP {status}")]
    WebhookRejected { status: u16 },

    // ── Mutation / guardrail errors ────────────────────────────
    #[error("invalid mutation: {0}")]
    Validation(String),

    #[error("guardrail violation: {rule}: {reason}")]
    Guardrail { rule: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PulseError {
    /// The guardrail rule name for `Guardrail` errors, if any.
    pub fn rule(&self) -> Option<&str> {
        match self {
            PulseError::Guardrail { rule, .. } => Some(rule),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PulseError>;
