use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::StateSnapshot;

/// Text-format metrics for the `/metrics` endpoint.
///
/// Counters are process-lifetime atomics; per-drive pressure gauges render
/// from the current snapshot at scrape time.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    http_requests_total: AtomicU64,
    triggers_total: AtomicU64,
    trigger_failures_total: AtomicU64,
    feedback_success_total: AtomicU64,
    feedback_partial_total: AtomicU64,
    feedback_failure_total: AtomicU64,
    mutations_applied_total: AtomicU64,
    mutations_rejected_total: AtomicU64,
    unknown_fields_total: AtomicU64,
    loop_iterations_total: AtomicU64,
    loop_failures_total: AtomicU64,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                http_requests_total: AtomicU64::new(0),
                triggers_total: AtomicU64::new(0),
                trigger_failures_total: AtomicU64::new(0),
                feedback_success_total: AtomicU64::new(0),
                feedback_partial_total: AtomicU64::new(0),
                feedback_failure_total: AtomicU64::new(0),
                mutations_applied_total: AtomicU64::new(0),
                mutations_rejected_total: AtomicU64::new(0),
                unknown_fields_total: AtomicU64::new(0),
                loop_iterations_total: AtomicU64::new(0),
                loop_failures_total: AtomicU64::new(0),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn inc_http_requests(&self) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_triggers(&self) {
        self.inner.triggers_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_trigger_failures(&self) {
        self.inner
            .trigger_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_feedback(&self, outcome: &str) {
        let counter = match outcome {
            "success" => &self.inner.feedback_success_total,
            "partial" => &self.inner.feedback_partial_total,
            _ => &self.inner.feedback_failure_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mutations_applied(&self) {
        self.inner
            .mutations_applied_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_mutations_rejected(&self) {
        self.inner
            .mutations_rejected_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_unknown_fields(&self) {
        self.inner.unknown_fields_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_loop_iterations(&self) {
        self.inner
            .loop_iterations_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_loop_failures(&self) {
        self.inner.loop_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    /// Render in Prometheus text exposition format, with per-drive gauges
    /// from the current snapshot.
    pub fn render(&self, snapshot: &StateSnapshot) -> String {
        let m = &self.inner;
        let mut out = format!(
            r#"# HELP pulse_uptime_seconds Time since the daemon started.
# TYPE pulse_uptime_seconds gauge
pulse_uptime_seconds {}

# HELP pulse_http_requests_total Total HTTP requests served.
# TYPE pulse_http_requests_total counter
pulse_http_requests_total {}

# HELP pulse_triggers_total Total wake-up triggers dispatched.
# TYPE pulse_triggers_total counter
pulse_triggers_total {}

# HELP pulse_trigger_failures_total Trigger dispatches that failed.
# TYPE pulse_trigger_failures_total counter
pulse_trigger_failures_total {}

# HELP pulse_feedback_total Feedback submissions by outcome.
# TYPE pulse_feedback_total counter
pulse_feedback_total{{outcome="success"}} {}
pulse_feedback_total{{outcome="partial"}} {}
pulse_feedback_total{{outcome="failure"}} {}

# HELP pulse_mutations_applied_total Mutations applied.
# TYPE pulse_mutations_applied_total counter
pulse_mutations_applied_total {}

# HELP pulse_mutations_rejected_total Mutations rejected by validation or guardrails.
# TYPE pulse_mutations_rejected_total counter
pulse_mutations_rejected_total {}

# HELP pulse_unknown_fields_total Unknown fields ignored in request bodies.
# TYPE pulse_unknown_fields_total counter
pulse_unknown_fields_total {}

# HELP pulse_loop_iterations_total Main loop iterations completed.
# TYPE pulse_loop_iterations_total counter
pulse_loop_iterations_total {}

# HELP pulse_loop_failures_total Main loop iterations that failed.
# TYPE pulse_loop_failures_total counter
pulse_loop_failures_total {}

# HELP pulse_total_pressure Combined weighted drive pressure.
# TYPE pulse_total_pressure gauge
pulse_total_pressure {}
"#,
            self.uptime_secs(),
            m.http_requests_total.load(Ordering::Relaxed),
            m.triggers_total.load(Ordering::Relaxed),
            m.trigger_failures_total.load(Ordering::Relaxed),
            m.feedback_success_total.load(Ordering::Relaxed),
            m.feedback_partial_total.load(Ordering::Relaxed),
            m.feedback_failure_total.load(Ordering::Relaxed),
            m.mutations_applied_total.load(Ordering::Relaxed),
            m.mutations_rejected_total.load(Ordering::Relaxed),
            m.unknown_fields_total.load(Ordering::Relaxed),
            m.loop_iterations_total.load(Ordering::Relaxed),
            m.loop_failures_total.load(Ordering::Relaxed),
            snapshot.total_pressure,
        );

        out.push_str("\n# HELP pulse_drive_pressure Current pressure per drive.\n");
        out.push_str("# TYPE pulse_drive_pressure gauge\n");
        for drive in &snapshot.drives {
            out.push_str(&format!(
                "pulse_drive_pressure{{drive=\"{}\"}} {}\n",
                drive.name, drive.pressure
            ));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
