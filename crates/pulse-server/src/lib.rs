//! # pulse-server
//!
//! The daemon's HTTP surface: liveness, full state, config reads and
//! mutation submissions, manual triggers, feedback ingestion, the audit
//! tail, and text-format metrics.
//!
//! Concurrency contract: GET handlers serve a read-only snapshot the main
//! loop publishes each iteration (double-buffered behind an `RwLock<Arc>`),
//! so readers never block the loop. Handlers that mutate core state enqueue
//! a [`DaemonCommand`] onto a bounded channel the main loop drains — the
//! loop stays the only writer of drive and mutator state.

pub mod metrics;

pub use metrics::Metrics;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use pulse_core::{
    AuditEntry, AuditOutcome, Drive, Feedback, FeedbackResult, SensorSnapshot,
    TriggerHistoryEntry,
};
use pulse_state::AuditLog;

// ── Snapshot types ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct DriveView {
    pub name: String,
    pub pressure: f64,
    pub weighted_pressure: f64,
    pub weight: f64,
    pub last_addressed: f64,
    pub sources: Vec<String>,
    pub protected: bool,
}

impl From<&Drive> for DriveView {
    fn from(d: &Drive) -> Self {
        Self {
            name: d.name.clone(),
            pressure: d.pressure,
            weighted_pressure: d.weighted_pressure(),
            weight: d.weight,
            last_addressed: d.last_addressed,
            sources: d.sources.clone(),
            protected: d.protected,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigView {
    pub trigger_threshold: f64,
    pub pressure_rate: f64,
    pub min_trigger_interval_secs: u64,
    pub max_turns_per_hour: u32,
    pub max_pressure: f64,
    pub success_decay: f64,
    pub evaluator_mode: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluatorView {
    pub mode: String,
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimitView {
    pub turns_last_hour: usize,
    pub max_turns_per_hour: u32,
    pub cooldown_remaining_secs: u64,
    pub mutations_last_hour: usize,
    pub max_mutations_per_hour: usize,
}

/// Read-only view the main loop publishes at the end of each iteration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StateSnapshot {
    pub status: String,
    pub turn_count: u64,
    pub drives: Vec<DriveView>,
    pub total_pressure: f64,
    pub sensors: SensorSnapshot,
    pub config: ConfigView,
    pub evaluator: EvaluatorView,
    pub rate_limit: RateLimitView,
    pub last_trigger: Option<TriggerHistoryEntry>,
}

/// Double-buffered snapshot: the writer swaps the inner `Arc`, readers
/// clone it and never hold the lock across serialization.
pub type SharedSnapshot = Arc<RwLock<Arc<StateSnapshot>>>;

pub fn new_shared_snapshot() -> SharedSnapshot {
    Arc::new(RwLock::new(Arc::new(StateSnapshot::default())))
}

pub fn publish(shared: &SharedSnapshot, snapshot: StateSnapshot) {
    *shared.write() = Arc::new(snapshot);
}

// ── Commands to the main loop ──────────────────────────────────

#[derive(Debug)]
pub enum TriggerOutcome {
    Dispatched { status: String },
    RateLimited,
    WebhookFailed { status: String },
}

/// State-mutating requests, drained by the daemon's main loop in arrival
/// order. Each carries a oneshot for the HTTP reply.
#[derive(Debug)]
pub enum DaemonCommand {
    Mutation {
        value: serde_json::Value,
        reply: oneshot::Sender<AuditEntry>,
    },
    Feedback {
        feedback: Feedback,
        reply: oneshot::Sender<HashMap<String, FeedbackResult>>,
    },
    Trigger {
        reply: oneshot::Sender<TriggerOutcome>,
    },
}

const REPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

// ── Server ─────────────────────────────────────────────────────

pub struct AppState {
    pub snapshot: SharedSnapshot,
    pub commands: mpsc::Sender<DaemonCommand>,
    pub metrics: Metrics,
    pub audit: Arc<AuditLog>,
    pub mutations_enabled: bool,
    pub version: &'static str,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/state", get(state_handler))
        .route("/config", get(config_get_handler).post(config_post_handler))
        .route("/trigger", post(trigger_handler))
        .route("/feedback", post(feedback_handler))
        .route("/mutations", get(mutations_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves. Returns the bound address.
pub async fn start(
    state: Arc<AppState>,
    host: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> pulse_core::Result<std::net::SocketAddr> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|e| {
            pulse_core::PulseError::Config(format!("failed to bind {host}:{port}: {e}"))
        })?;
    let addr = listener.local_addr()?;
    let router = build_router(state);
    info!(%addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "health server exited with error");
        }
    });
    Ok(addr)
}

// ── Handlers ───────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    uptime_s: u64,
    version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    state.metrics.inc_http_requests();
    let status = {
        let snap = state.snapshot.read().clone();
        if snap.status.is_empty() {
            "ok".to_string()
        } else {
            snap.status.clone()
        }
    };
    Json(HealthResponse {
        status,
        uptime_s: state.metrics.uptime_secs(),
        version: state.version.to_string(),
    })
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Json<Arc<StateSnapshot>> {
    state.metrics.inc_http_requests();
    Json(state.snapshot.read().clone())
}

async fn config_get_handler(State(state): State<Arc<AppState>>) -> Json<ConfigView> {
    state.metrics.inc_http_requests();
    Json(state.snapshot.read().config.clone())
}

/// Submit a mutation over HTTP. Same validation path as the queue file;
/// the main loop applies it and the resulting audit entry comes back.
async fn config_post_handler(
    State(state): State<Arc<AppState>>,
    Json(value): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<AuditEntry>), StatusCode> {
    state.metrics.inc_http_requests();
    if !state.mutations_enabled {
        return Err(StatusCode::FORBIDDEN);
    }
    let (reply, rx) = oneshot::channel();
    state
        .commands
        .send(DaemonCommand::Mutation { value, reply })
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let entry = tokio::time::timeout(REPLY_TIMEOUT, rx)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    // Domain counters (mutations applied/rejected) are fed by the daemon's
    // event bus, which sees the file queue too — not here.
    match entry.outcome {
        AuditOutcome::Applied => Ok((StatusCode::OK, Json(entry))),
        AuditOutcome::Rejected => Ok((StatusCode::BAD_REQUEST, Json(entry))),
    }
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    state.metrics.inc_http_requests();
    let (reply, rx) = oneshot::channel();
    state
        .commands
        .send(DaemonCommand::Trigger { reply })
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let outcome = tokio::time::timeout(REPLY_TIMEOUT, rx)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    match outcome {
        TriggerOutcome::Dispatched { status } => Ok((
            StatusCode::OK,
            Json(serde_json::json!({"status": "dispatched", "webhook_status": status})),
        )),
        TriggerOutcome::RateLimited => Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"status": "rate_limited"})),
        )),
        TriggerOutcome::WebhookFailed { status } => Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "webhook_failed", "webhook_status": status})),
        )),
    }
}

const FEEDBACK_FIELDS: [&str; 4] = ["drives_addressed", "outcome", "summary", "decay_overrides"];

async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    Json(value): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    state.metrics.inc_http_requests();

    // Unknown fields are ignored by policy, but counted and logged.
    if let Some(obj) = value.as_object() {
        for key in obj.keys() {
            if !FEEDBACK_FIELDS.contains(&key.as_str()) {
                warn!(field = %key, "ignoring unknown feedback field");
                state.metrics.inc_unknown_fields();
            }
        }
    }

    let feedback: Feedback =
        serde_json::from_value(value).map_err(|_| StatusCode::BAD_REQUEST)?;

    let (reply, rx) = oneshot::channel();
    state
        .commands
        .send(DaemonCommand::Feedback { feedback, reply })
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    let results = tokio::time::timeout(REPLY_TIMEOUT, rx)
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({"status": "ok", "drives_updated": results})),
    ))
}

const MUTATIONS_DEFAULT_N: usize = 20;

async fn mutations_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    state.metrics.inc_http_requests();
    // Malformed `n` falls back to the default; valid values clamp to [1, 1000].
    let n = params
        .get("n")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(MUTATIONS_DEFAULT_N)
        .clamp(1, 1000);
    Json(serde_json::json!({
        "recent": state.audit.recent(n),
        "summary": state.audit.summary(),
    }))
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
) -> ([(axum::http::header::HeaderName, &'static str); 1], String) {
    state.metrics.inc_http_requests();
    let snapshot = state.snapshot.read().clone();
    let body = state.metrics.render(&snapshot);
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}
