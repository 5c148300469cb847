use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration — maps to `pulse.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub daemon: DaemonConfig,
    pub webhook: WebhookConfig,
    pub drives: DrivesConfig,
    pub evolution: EvolutionConfig,
    pub guardrails: GuardrailConfig,
    pub evaluator: EvaluatorConfig,
    pub sensors: SensorsConfig,
    pub state: StateConfig,
    pub workspace: WorkspaceConfig,
    pub logging: LoggingConfig,
}

// ── Daemon ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between main-loop iterations.
    pub loop_interval_secs: u64,
    /// Host the health server binds to.
    pub health_host: String,
    /// Port the health server binds to. Source documents disagree (9719 vs
    /// 9720); this is explicit config, never inferred.
    pub health_port: u16,
    /// Consecutive failed loop iterations before the daemon gives up.
    pub max_consecutive_loop_failures: u32,
    /// When false, `POST /config` and the queue file are refused (403).
    pub enable_mutations: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            loop_interval_secs: 30,
            health_host: "127.0.0.1".into(),
            health_port: 9720,
            max_consecutive_loop_failures: 5,
            enable_mutations: true,
        }
    }
}

// ── Webhook / agent host ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Full URL of the agent-turn hook, e.g. `http://127.0.0.1:18789/hooks/agent`.
    /// The auxiliary wake endpoint is derived from its scheme + host.
    pub url: String,
    /// Bearer token. Empty means unauthenticated (warned at startup).
    /// Can be supplied via the PULSE_HOOK_TOKEN environment variable.
    pub token: String,
    /// Header name carrying the bearer token. Source documents disagree on
    /// the name, so it is config with an explicit default.
    pub auth_header: String,
    pub timeout_secs: u64,
    /// Retries on transport errors and 5xx. 4xx is never retried.
    pub max_retries: u32,
    /// Prefix prepended to every trigger message.
    pub message_prefix: String,
    /// Minimum seconds between dispatched triggers, any path.
    pub min_trigger_interval_secs: u64,
    /// Rolling-hour cap on dispatched triggers, persisted across restarts.
    pub max_turns_per_hour: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:18789/hooks/agent".into(),
            token: String::new(),
            auth_header: "Authorization".into(),
            timeout_secs: 10,
            max_retries: 3,
            message_prefix: "[PULSE]".into(),
            min_trigger_interval_secs: 300,
            max_turns_per_hour: 10,
        }
    }
}

// ── Drives ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrivesConfig {
    /// Pressure gained per minute at weight 1.0.
    pub pressure_rate: f64,
    pub max_pressure: f64,
    /// Combined weighted pressure needed to trigger.
    pub trigger_threshold: f64,
    /// Fraction of the top drive's pressure removed on successful feedback.
    pub success_decay: f64,
    /// Spike applied to the top drive after a failed webhook dispatch.
    pub failure_boost: f64,
    /// Spike applied when a drive's watched source changes.
    pub source_spike: f64,
    /// Minimum individual weighted pressure for a trigger — many tiny drives
    /// summing over the threshold is not a trigger.
    pub min_individual_pressure: f64,
    /// Scale factor on proportional decay of non-top drives. The original
    /// derivation of the 2.0 value is unclear, so it is tunable.
    pub proportional_decay_scale: f64,
    /// Scale success decay with total pressure when pressure is high.
    pub adaptive_decay: bool,
    /// Total pressure above which the high-pressure override can fire.
    pub high_pressure_threshold: f64,
    /// Idle seconds (since last conversation activity) required for the
    /// high-pressure override.
    pub high_pressure_idle_secs: u64,
    /// Drives created at startup, keyed by name. BTreeMap keeps a stable
    /// order so tie-breaking is deterministic across runs.
    pub categories: BTreeMap<String, DriveCategory>,
}

impl Default for DrivesConfig {
    fn default() -> Self {
        let mut categories = BTreeMap::new();
        categories.insert(
            "goals".to_string(),
            DriveCategory {
                weight: 1.0,
                sources: Vec::new(),
                protected: true,
            },
        );
        categories.insert(
            "growth".to_string(),
            DriveCategory {
                weight: 0.8,
                sources: Vec::new(),
                protected: true,
            },
        );
        categories.insert(
            "curiosity".to_string(),
            DriveCategory {
                weight: 0.7,
                sources: Vec::new(),
                protected: false,
            },
        );
        Self {
            pressure_rate: 0.05,
            max_pressure: 10.0,
            trigger_threshold: 5.0,
            success_decay: 0.7,
            failure_boost: 0.2,
            source_spike: 1.5,
            min_individual_pressure: 1.5,
            proportional_decay_scale: 2.0,
            adaptive_decay: false,
            high_pressure_threshold: 10.0,
            high_pressure_idle_secs: 1800,
            categories,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveCategory {
    pub weight: f64,
    /// File paths whose changes spike this drive.
    pub sources: Vec<String>,
    pub protected: bool,
}

impl Default for DriveCategory {
    fn default() -> Self {
        Self {
            weight: 1.0,
            sources: Vec::new(),
            protected: false,
        }
    }
}

// ── Weight evolution ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub enabled: bool,
    /// Evolve at most once per this many loop iterations.
    pub interval_loops: u64,
    /// Maximum weight change per drive per evolution cycle.
    pub max_delta_per_cycle: f64,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_loops: 50,
            max_delta_per_cycle: 0.1,
        }
    }
}

// ── Guardrails ─────────────────────────────────────────────────

/// Hard limits that self-modification cannot exceed. The agent can rewire
/// its motivations, but not disable its own safety checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub min_weight: f64,
    pub max_weight: f64,
    /// Weight floor for protected drives, higher than `min_weight`.
    pub protected_min_weight: f64,
    /// Maximum weight change per mutation.
    pub max_weight_delta: f64,
    pub min_trigger_threshold: f64,
    pub max_trigger_threshold: f64,
    pub min_pressure_rate: f64,
    pub max_pressure_rate: f64,
    pub min_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    pub min_turns_per_hour: u32,
    pub max_turns_per_hour: u32,
    /// Bound on manual spike/decay amounts.
    pub max_manual_delta: f64,
    pub max_drives: usize,
    /// Rolling-hour cap on mutations of any kind, persisted across restarts.
    pub max_mutations_per_hour: usize,
    /// Drives that cannot be removed. "goals" and "growth" are always
    /// protected regardless of this list.
    pub protected_drives: Vec<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            min_weight: 0.05,
            max_weight: 3.0,
            protected_min_weight: 0.5,
            max_weight_delta: 0.1,
            min_trigger_threshold: 0.5,
            max_trigger_threshold: 50.0,
            min_pressure_rate: 0.001,
            max_pressure_rate: 1.0,
            min_cooldown_secs: 60,
            max_cooldown_secs: 7200,
            min_turns_per_hour: 1,
            max_turns_per_hour: 60,
            max_manual_delta: 2.0,
            max_drives: 15,
            max_mutations_per_hour: 10,
            protected_drives: vec!["goals".into(), "growth".into()],
        }
    }
}

// ── Evaluator ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// "rules" or "model".
    pub mode: String,
    pub rules: RulesConfig,
    pub model: ModelEvalConfig,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            mode: "rules".into(),
            rules: RulesConfig::default(),
            model: ModelEvalConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Conversation activity within this window suppresses triggering.
    pub activity_threshold_secs: u64,
    /// After activity ends, stay suppressed for this long.
    pub conversation_cooldown_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            activity_threshold_secs: 120,
            conversation_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelEvalConfig {
    /// OpenAI-compatible chat completions base URL. Ollama by default.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Cap on model-requested suppress_minutes.
    pub max_suppress_minutes: u64,
    /// Consecutive failures before degrading to rule mode.
    pub max_consecutive_failures: u32,
    /// Seconds between recovery probes while degraded.
    pub recovery_interval_secs: u64,
}

impl Default for ModelEvalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434/v1".into(),
            api_key: "ollama".into(),
            model: "llama3.2:3b".into(),
            max_tokens: 512,
            temperature: 0.3,
            timeout_secs: 10,
            max_suppress_minutes: 30,
            max_consecutive_failures: 3,
            recovery_interval_secs: 300,
        }
    }
}

// ── Sensors ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    pub filesystem: FilesystemSensorConfig,
    pub conversation: ConversationSensorConfig,
    pub system: SystemSensorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemSensorConfig {
    pub enabled: bool,
    pub watch_paths: Vec<PathBuf>,
    /// Glob-ish patterns (matched against file name or full path).
    pub ignore_patterns: Vec<String>,
    /// Drop events for paths the daemon itself wrote.
    pub ignore_self_writes: bool,
}

impl Default for FilesystemSensorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_paths: Vec::new(),
            ignore_patterns: vec![".git".into(), "*.tmp".into(), "*.swp".into()],
            ignore_self_writes: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSensorConfig {
    /// Directories holding agent session transcripts.
    pub session_dirs: Vec<PathBuf>,
    /// Transcripts below this size are ignored — they are cron/hook session
    /// noise, not human conversation. The activity window itself is
    /// `evaluator.rules.activity_threshold_secs`.
    pub min_transcript_bytes: u64,
}

impl Default for ConversationSensorConfig {
    fn default() -> Self {
        Self {
            session_dirs: Vec::new(),
            min_transcript_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSensorConfig {
    pub enabled: bool,
    /// Alert when free memory falls below this many MiB.
    pub memory_threshold_mb: u64,
    /// Process names that must be alive (checked via pgrep).
    pub watch_processes: Vec<String>,
    /// Budget for each external health command; on expiry the sensor
    /// returns its last known reading flagged stale.
    pub command_timeout_secs: u64,
}

impl Default for SystemSensorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_threshold_mb: 200,
            watch_processes: Vec::new(),
            command_timeout_secs: 1,
        }
    }
}

// ── State ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State directory; one daemon per directory, enforced by a process lock.
    pub dir: PathBuf,
    /// Seconds between periodic state saves.
    pub save_interval_secs: u64,
    /// Audit log rotates to `audit.old` above this size.
    pub audit_max_bytes: u64,
    /// Trigger history keeps at most this many entries.
    pub history_max_entries: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.pulse/state"),
            save_interval_secs: 60,
            audit_max_bytes: 5 * 1024 * 1024,
            history_max_entries: 500,
        }
    }
}

// ── Workspace ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Optional working-memory JSON file included (truncated) in the model
    /// evaluator's prompt.
    pub working_memory: Option<PathBuf>,
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Default for root ───────────────────────────────────────────

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            webhook: WebhookConfig::default(),
            drives: DrivesConfig::default(),
            evolution: EvolutionConfig::default(),
            guardrails: GuardrailConfig::default(),
            evaluator: EvaluatorConfig::default(),
            sensors: SensorsConfig::default(),
            state: StateConfig::default(),
            workspace: WorkspaceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl PulseConfig {
    /// State directory with `~` expanded.
    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.state.dir)
    }

    /// Weight floor for a drive: protected drives have the higher floor.
    pub fn weight_floor(&self, protected: bool) -> f64 {
        if protected {
            self.guardrails.protected_min_weight
        } else {
            self.guardrails.min_weight
        }
    }

    /// Whether a drive name belongs to the protected set.
    pub fn is_protected_drive(&self, name: &str) -> bool {
        name == "goals"
            || name == "growth"
            || self.guardrails.protected_drives.iter().any(|d| d == name)
            || self
                .drives
                .categories
                .get(name)
                .is_some_and(|c| c.protected)
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &std::path::Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl PulseConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();
        let error = |field: &str, message: String| ConfigWarning {
            field: field.into(),
            message,
            severity: WarningSeverity::Error,
        };

        if self.drives.pressure_rate <= 0.0 {
            warnings.push(error(
                "drives.pressure_rate",
                "must be positive".to_string(),
            ));
        }
        if self.drives.max_pressure <= 0.0 {
            warnings.push(error("drives.max_pressure", "must be positive".to_string()));
        }
        if self.drives.trigger_threshold <= 0.0 {
            warnings.push(error(
                "drives.trigger_threshold",
                "must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.drives.success_decay) {
            warnings.push(error(
                "drives.success_decay",
                format!("{} is out of [0, 1]", self.drives.success_decay),
            ));
        }
        if self.daemon.loop_interval_secs < 1 {
            warnings.push(error("daemon.loop_interval_secs", "must be >= 1".to_string()));
        }
        if self.webhook.max_turns_per_hour < 1 {
            warnings.push(error(
                "webhook.max_turns_per_hour",
                "must be >= 1".to_string(),
            ));
        }
        if self.evaluator.mode != "rules" && self.evaluator.mode != "model" {
            warnings.push(error(
                "evaluator.mode",
                format!("must be 'rules' or 'model', got '{}'", self.evaluator.mode),
            ));
        }
        if self.guardrails.min_weight >= self.guardrails.max_weight {
            warnings.push(error(
                "guardrails.min_weight",
                "must be below guardrails.max_weight".to_string(),
            ));
        }

        if self.webhook.token.is_empty() {
            warnings.push(ConfigWarning {
                field: "webhook.token".into(),
                message: "no webhook token set — calls will be unauthenticated \
                          (set PULSE_HOOK_TOKEN or webhook.token)"
                    .into(),
                severity: WarningSeverity::Warning,
            });
        }
        if self.daemon.health_host.starts_with("0.0.0.0") {
            warnings.push(ConfigWarning {
                field: "daemon.health_host".into(),
                message: "binding to 0.0.0.0 — health server is reachable from all interfaces"
                    .into(),
                severity: WarningSeverity::Warning,
            });
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| w.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(format!("configuration errors:\n  - {}", errors.join("\n  - ")));
        }
        Ok(warnings)
    }
}
