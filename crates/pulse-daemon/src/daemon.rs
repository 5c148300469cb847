use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use pulse_config::PulseConfig;
use pulse_core::{
    Clock, EventBus, Feedback, FeedbackOutcome, PulseEvent, SensorSnapshot, SharedTunables,
    SystemClock, TriggerDecision, TriggerHistoryEntry, Tunables,
};
use pulse_drives::{DriveEngine, PerformanceTracker, WeightEvolution};
use pulse_eval::{Evaluator, ModelEvaluator, RuleEvaluator};
use pulse_evolve::{Guardrails, Mutator};
use pulse_sensors::{SelfWriteRegistry, SensorManager, SourceWatchlist};
use pulse_server::{
    publish, AppState, ConfigView, DaemonCommand, DriveView, EvaluatorView, Metrics,
    RateLimitView, SharedSnapshot, StateSnapshot, TriggerOutcome,
};
use pulse_state::{AuditLog, ProcessLock, StateStore};
use pulse_webhook::WebhookClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Entry point: owns config and clock, builds the runtime, runs the loop.
pub struct PulseDaemon {
    config: PulseConfig,
    clock: Arc<dyn Clock>,
}

impl PulseDaemon {
    pub fn new(config: PulseConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Start the daemon. Blocks until a shutdown signal.
    pub async fn run(self) -> pulse_core::Result<()> {
        let state_dir = self.config.state_dir();

        // Exactly one daemon per state directory; the guard lives for the
        // whole run and the OS releases it even on a hard kill.
        let mut lock = ProcessLock::new(&state_dir)?;
        let _lock_guard = lock.acquire()?;

        let mut runtime = Runtime::build(self.config, self.clock)?;

        info!(version = VERSION, "pulse starting — daemon online");
        info!(webhook = %runtime.webhook.agent_url(), "agent hook configured");
        info!(
            loop_interval_secs = runtime.config.daemon.loop_interval_secs,
            trigger_threshold = runtime.tunables.read().trigger_threshold,
            evaluator = runtime.evaluator.mode(),
            "configuration loaded"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_signal_handler(shutdown_tx);

        let (command_tx, command_rx) = mpsc::channel::<DaemonCommand>(64);
        let app_state = Arc::new(AppState {
            snapshot: runtime.shared_snapshot.clone(),
            commands: command_tx,
            metrics: runtime.metrics.clone(),
            audit: runtime.audit.clone(),
            mutations_enabled: runtime.config.daemon.enable_mutations,
            version: VERSION,
        });
        let server_shutdown = {
            let mut rx = shutdown_rx.clone();
            async move {
                let _ = rx.wait_for(|stop| *stop).await;
            }
        };
        let host = runtime.config.daemon.health_host.clone();
        let port = runtime.config.daemon.health_port;
        if let Err(e) = pulse_server::start(app_state, &host, port, server_shutdown).await {
            // A busy port degrades observability but not the loop itself.
            warn!(error = %e, "could not start health server");
        }

        spawn_metrics_subscriber(&runtime.bus, runtime.metrics.clone());

        runtime.sensors.initialize().await?;
        runtime.refresh_source_watchlist();

        let result = runtime.main_loop(shutdown_rx, command_rx).await;

        // Graceful teardown: the final save is never skipped.
        runtime.persist(true);
        runtime.sensors.stop().await;
        info!("pulse stopped — daemon offline");
        drop(_lock_guard);
        result
    }
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "could not install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

/// Forward bus events into the metrics registry. Counters live here, not in
/// the HTTP handlers, so file-queue activity counts the same as HTTP.
fn spawn_metrics_subscriber(bus: &EventBus, metrics: Metrics) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(PulseEvent::TriggerSucceeded { .. }) => metrics.inc_triggers(),
                Ok(PulseEvent::TriggerFailed { .. }) => metrics.inc_trigger_failures(),
                Ok(PulseEvent::MutationApplied { .. }) => metrics.inc_mutations_applied(),
                Ok(PulseEvent::MutationRejected { .. }) => metrics.inc_mutations_rejected(),
                Ok(PulseEvent::FeedbackReceived { outcome, .. }) => {
                    metrics.inc_feedback(&outcome)
                }
                Ok(PulseEvent::StateSaved { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

/// Everything the main loop owns. No other task mutates any of this.
struct Runtime {
    config: PulseConfig,
    clock: Arc<dyn Clock>,
    store: StateStore,
    audit: Arc<AuditLog>,
    engine: DriveEngine,
    mutator: Mutator,
    evaluator: Box<dyn Evaluator>,
    sensors: SensorManager,
    webhook: WebhookClient,
    tunables: SharedTunables,
    bus: EventBus,
    metrics: Metrics,
    shared_snapshot: SharedSnapshot,
    self_writes: SelfWriteRegistry,
    watchlist: SourceWatchlist,
    tracker: PerformanceTracker,
    evolution: WeightEvolution,
    turn_count: u64,
    last_trigger_time: f64,
    turn_timestamps: Vec<f64>,
    last_tick: f64,
    last_sensors: SensorSnapshot,
    degraded: bool,
}

impl Runtime {
    fn build(config: PulseConfig, clock: Arc<dyn Clock>) -> pulse_core::Result<Self> {
        let state_dir = config.state_dir();
        let store = StateStore::open(
            &state_dir,
            config.state.save_interval_secs,
            config.state.history_max_entries,
            clock.clone(),
        )?;
        let audit = Arc::new(AuditLog::open(&state_dir, config.state.audit_max_bytes)?);
        let now = clock.now();

        // Config values first, then any persisted agent overrides on top.
        let mut tunables = Tunables {
            trigger_threshold: config.drives.trigger_threshold,
            pressure_rate: config.drives.pressure_rate,
            min_trigger_interval_secs: config.webhook.min_trigger_interval_secs,
            max_turns_per_hour: config.webhook.max_turns_per_hour,
        };
        if let Some(overrides) = store.get::<Tunables>("config_overrides") {
            info!(?overrides, "restored config overrides");
            tunables = overrides;
        }
        let tunables: SharedTunables = Arc::new(parking_lot::RwLock::new(tunables));

        let mut engine = DriveEngine::from_config(&config);
        if let Some(snapshot) = store.get::<Vec<pulse_core::Drive>>("drives") {
            engine.restore(snapshot);
        }
        engine.set_pressure_rate(tunables.read().pressure_rate);

        let guardrails = Guardrails::new(
            config.guardrails.clone(),
            store.get::<Vec<f64>>("mutation_timestamps").unwrap_or_default(),
            now,
        );
        let mutator = Mutator::new(guardrails, &state_dir, audit.clone(), tunables.clone());

        let evaluator: Box<dyn Evaluator> = if config.evaluator.mode == "model" {
            Box::new(ModelEvaluator::new(&config, tunables.clone()))
        } else {
            Box::new(RuleEvaluator::new(&config, tunables.clone()))
        };

        let sensors = SensorManager::from_config(&config);
        let self_writes = sensors.self_writes();
        let watchlist = sensors.source_watchlist();
        let webhook = WebhookClient::new(&config.webhook)?;

        let turn_timestamps: Vec<f64> = store
            .get::<Vec<f64>>("turn_timestamps")
            .unwrap_or_default()
            .into_iter()
            .filter(|t| now - *t < 3600.0)
            .collect();
        let last_trigger_time = store
            .last_trigger()
            .map(|t| t.timestamp)
            .unwrap_or(0.0);
        let turn_count = store.get::<u64>("turn_count").unwrap_or(0);
        let evolution = WeightEvolution::from_config(&config);

        Ok(Self {
            config,
            clock: clock.clone(),
            store,
            audit,
            engine,
            mutator,
            evaluator,
            sensors,
            webhook,
            tunables,
            bus: EventBus::default(),
            metrics: Metrics::new(),
            shared_snapshot: pulse_server::new_shared_snapshot(),
            self_writes,
            watchlist,
            tracker: PerformanceTracker::default(),
            evolution,
            turn_count,
            last_trigger_time,
            turn_timestamps,
            last_tick: now,
            last_sensors: SensorSnapshot::default(),
            degraded: false,
        })
    }

    async fn main_loop(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        mut commands: mpsc::Receiver<DaemonCommand>,
    ) -> pulse_core::Result<()> {
        let loop_interval = Duration::from_secs(self.config.daemon.loop_interval_secs);
        let mut consecutive_failures = 0u32;

        info!("entering main loop");
        while !*shutdown.borrow() {
            let iteration_started = tokio::time::Instant::now();

            match self.iteration().await {
                Ok(()) => {
                    consecutive_failures = 0;
                    self.metrics.inc_loop_iterations();
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.degraded = true;
                    self.metrics.inc_loop_failures();
                    error!(
                        error = %e,
                        consecutive_failures,
                        "loop iteration failed"
                    );
                    if consecutive_failures >= self.config.daemon.max_consecutive_loop_failures {
                        error!("too many consecutive loop failures — giving up");
                        return Err(e);
                    }
                }
            }

            self.publish_snapshot();

            // Sleep out the remainder of the interval, serving commands as
            // they arrive. Commands mutate core state on this task only.
            let deadline = iteration_started + loop_interval;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                    cmd = commands.recv() => {
                        match cmd {
                            Some(cmd) => {
                                self.handle_command(cmd).await;
                                self.publish_snapshot();
                            }
                            None => return Ok(()),
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }
        Ok(())
    }

    /// One loop iteration: sense → tick → drain mutations → decide →
    /// webhook → persist. Feedback arrives through the command channel
    /// between iterations, never reentrantly.
    async fn iteration(&mut self) -> pulse_core::Result<()> {
        let now = self.clock.now();
        let dt = (now - self.last_tick).max(0.0);
        self.last_tick = now;

        let sensors = self.sensors.read_all(now).await;
        let drive_state = self.engine.tick(dt, &sensors, now);
        debug!(
            total_pressure = drive_state.total_pressure,
            convo_active = sensors.conversation.active,
            "tick"
        );
        self.last_sensors = sensors.clone();

        if self.config.daemon.enable_mutations {
            let entries = self.mutator.drain_queue(&mut self.engine, now);
            if !entries.is_empty() {
                self.after_mutations(&entries);
            }
        }

        let decision = self.evaluator.decide(&drive_state, &sensors, now).await;
        debug!(
            trigger = decision.should_trigger,
            reason = %decision.reason,
            "evaluated"
        );

        if decision.should_trigger {
            if self.can_trigger(now) {
                self.dispatch_trigger(decision, now).await;
            } else {
                debug!(
                    pressure = decision.total_pressure,
                    "trigger withheld (cooldown or hourly cap)"
                );
            }
        }

        if let Some(changes) = self.evolution.maybe_evolve(&mut self.engine, &self.tracker) {
            if !changes.is_empty() {
                info!(count = changes.len(), "drive weights evolved");
            }
        }

        self.persist(false);
        Ok(())
    }

    /// Cooldown and the rolling-hour cap gate every trigger path uniformly.
    fn can_trigger(&mut self, now: f64) -> bool {
        let (cooldown, max_turns) = {
            let t = self.tunables.read();
            (t.min_trigger_interval_secs as f64, t.max_turns_per_hour)
        };
        if self.last_trigger_time > 0.0 && now - self.last_trigger_time < cooldown {
            return false;
        }
        self.turn_timestamps.retain(|t| now - *t < 3600.0);
        if self.turn_timestamps.len() >= max_turns as usize {
            warn!(
                turns_last_hour = self.turn_timestamps.len(),
                max_turns, "hourly turn cap reached"
            );
            return false;
        }
        true
    }

    async fn dispatch_trigger(&mut self, decision: TriggerDecision, now: f64) -> TriggerOutcome {
        self.last_trigger_time = now;
        self.turn_timestamps.push(now);
        self.turn_count += 1;

        let trigger_id = uuid::Uuid::new_v4().to_string();
        let message = match &decision.top_drive {
            Some(top) => format!(
                "{} — top drive: {} ({:.2}), total pressure {:.2}. {}",
                decision.reason, top.name, top.pressure, decision.total_pressure,
                decision.sensor_context
            ),
            None => format!(
                "{} — total pressure {:.2}. {}",
                decision.reason, decision.total_pressure, decision.sensor_context
            ),
        };
        let pressures: serde_json::Map<String, serde_json::Value> = self
            .engine
            .iter()
            .map(|d| (d.name.clone(), serde_json::json!(d.pressure)))
            .collect();
        let metadata = serde_json::json!({
            "trigger_id": trigger_id,
            "timestamp": now,
            "turn": self.turn_count,
            "reason": decision.reason,
            "top_drive": decision.top_drive.as_ref().map(|t| t.name.clone()),
            "total_pressure": decision.total_pressure,
            "pressures": pressures,
        });

        info!(
            turn = self.turn_count,
            reason = %decision.reason,
            pressure = decision.total_pressure,
            "trigger dispatching"
        );
        let outcome = self.webhook.trigger(&message, metadata).await;

        let mut status = outcome.status.clone();
        if outcome.auth_missing {
            status.push_str(" auth=missing");
        }
        self.store.log_trigger(TriggerHistoryEntry {
            timestamp: now,
            reason: decision.reason.clone(),
            top_drive: decision.top_drive.as_ref().map(|t| t.name.clone()),
            total_pressure: decision.total_pressure,
            webhook_status: status.clone(),
            dispatched_turn_id: outcome.session_key.clone().or(Some(trigger_id)),
        });

        let result = if outcome.ok {
            self.engine.record_trigger();
            self.evaluator.record_trigger(&decision, true);
            self.bus.publish(PulseEvent::TriggerSucceeded {
                turn: self.turn_count,
                reason: decision.reason.clone(),
                top_drive: decision.top_drive.as_ref().map(|t| t.name.clone()),
                total_pressure: decision.total_pressure,
            });
            TriggerOutcome::Dispatched { status }
        } else {
            // No decay on a failed dispatch — the top drive gets a
            // frustration boost instead.
            self.engine.on_trigger_failure(&decision);
            self.evaluator.record_trigger(&decision, false);
            self.bus.publish(PulseEvent::TriggerFailed {
                turn: self.turn_count,
                reason: decision.reason.clone(),
                webhook_status: status.clone(),
            });
            TriggerOutcome::WebhookFailed { status }
        };

        // Turn accounting (count, hourly-cap slot, trigger history) must
        // survive a crash, or the persisted cooldown and rate limit
        // under-count across a restart.
        self.persist(true);
        result
    }

    async fn handle_command(&mut self, cmd: DaemonCommand) {
        let now = self.clock.now();
        match cmd {
            DaemonCommand::Mutation { value, reply } => {
                let entry = self.mutator.apply_value(value, &mut self.engine, now);
                self.after_mutations(std::slice::from_ref(&entry));
                let _ = reply.send(entry);
            }
            DaemonCommand::Feedback { feedback, reply } => {
                let results = self.apply_feedback(&feedback, now);
                let _ = reply.send(results);
            }
            DaemonCommand::Trigger { reply } => {
                let outcome = if self.can_trigger(now) {
                    let decision =
                        TriggerDecision::trigger("manual trigger", &self.engine.drive_state(now));
                    self.dispatch_trigger(decision, now).await
                } else {
                    TriggerOutcome::RateLimited
                };
                let _ = reply.send(outcome);
            }
        }
    }

    fn apply_feedback(
        &mut self,
        feedback: &Feedback,
        now: f64,
    ) -> std::collections::HashMap<String, pulse_core::FeedbackResult> {
        let results = self.engine.apply_feedback(feedback, now);

        let (success, quality) = match feedback.outcome {
            FeedbackOutcome::Success => (true, 1.0),
            FeedbackOutcome::Partial => (true, 0.5),
            FeedbackOutcome::Failure => (false, 0.0),
        };
        for name in results.keys() {
            self.tracker.record(name, success, quality);
        }

        let outcome_str = match feedback.outcome {
            FeedbackOutcome::Success => "success",
            FeedbackOutcome::Partial => "partial",
            FeedbackOutcome::Failure => "failure",
        };
        info!(
            outcome = outcome_str,
            drives = ?feedback.drives_addressed,
            summary = %feedback.summary.chars().take(60).collect::<String>(),
            "feedback applied"
        );
        self.bus.publish(PulseEvent::FeedbackReceived {
            outcome: outcome_str.to_string(),
            drives: feedback.drives_addressed.clone(),
        });

        // Feedback is a state change worth surviving a crash.
        self.persist(true);
        results
    }

    /// React to applied mutations: refresh the scrape watchlist (drives may
    /// have come or gone) and persist overrides plus the rate-limit window.
    fn after_mutations(&mut self, entries: &[pulse_core::AuditEntry]) {
        for entry in entries {
            match entry.outcome {
                pulse_core::AuditOutcome::Applied => {
                    self.bus.publish(PulseEvent::MutationApplied {
                        kind: entry.kind.clone(),
                        target: entry.target.clone(),
                    });
                }
                pulse_core::AuditOutcome::Rejected => {
                    self.bus.publish(PulseEvent::MutationRejected {
                        kind: entry.kind.clone(),
                        rule: entry.rule.clone().unwrap_or_default(),
                    });
                }
            }
        }
        self.refresh_source_watchlist();
        self.persist(true);
    }

    fn refresh_source_watchlist(&self) {
        let entries: Vec<(String, Vec<PathBuf>)> = self
            .engine
            .iter()
            .filter(|d| !d.sources.is_empty())
            .map(|d| {
                (
                    d.name.clone(),
                    d.sources.iter().map(PathBuf::from).collect(),
                )
            })
            .collect();
        self.watchlist.set(entries);
    }

    /// Sync runtime state into the store and save — immediately when
    /// `force`, else on the save cadence. A persistence failure degrades
    /// health and spikes the system drive rather than killing the loop.
    fn persist(&mut self, force: bool) {
        let now = self.clock.now();
        self.store.set("drives", self.engine.snapshot());
        self.store.set("config_overrides", &*self.tunables.read());
        self.store
            .set("mutation_timestamps", self.mutator.guardrails().mutation_timestamps());
        self.store.set("turn_timestamps", &self.turn_timestamps);
        self.store.set("turn_count", self.turn_count);

        self.self_writes.mark(self.store.path());
        let result = if force {
            self.store.save().map(|_| true)
        } else {
            self.store.maybe_save()
        };
        match result {
            Ok(saved) => {
                if saved {
                    self.degraded = false;
                    self.bus.publish(PulseEvent::StateSaved { at: now });
                }
            }
            Err(e) => {
                error!(error = %e, "state save failed");
                self.degraded = true;
                self.engine.spike_system_drive(0.5, now);
            }
        }
    }

    fn publish_snapshot(&mut self) {
        let now = self.clock.now();
        let t = self.tunables.read().clone();
        self.turn_timestamps.retain(|ts| now - *ts < 3600.0);
        let cooldown_remaining = if self.last_trigger_time > 0.0 {
            (t.min_trigger_interval_secs as f64 - (now - self.last_trigger_time)).max(0.0) as u64
        } else {
            0
        };

        let snapshot = StateSnapshot {
            status: if self.degraded {
                "degraded".into()
            } else {
                "alive".into()
            },
            turn_count: self.turn_count,
            drives: self.engine.iter().map(DriveView::from).collect(),
            total_pressure: self
                .engine
                .iter()
                .map(|d| d.weighted_pressure())
                .sum(),
            sensors: self.last_sensors.clone(),
            config: ConfigView {
                trigger_threshold: t.trigger_threshold,
                pressure_rate: t.pressure_rate,
                min_trigger_interval_secs: t.min_trigger_interval_secs,
                max_turns_per_hour: t.max_turns_per_hour,
                max_pressure: self.config.drives.max_pressure,
                success_decay: self.config.drives.success_decay,
                evaluator_mode: self.evaluator.mode().into(),
            },
            evaluator: EvaluatorView {
                mode: self.evaluator.mode().into(),
                degraded: self.evaluator.degraded(),
            },
            rate_limit: RateLimitView {
                turns_last_hour: self.turn_timestamps.len(),
                max_turns_per_hour: t.max_turns_per_hour,
                cooldown_remaining_secs: cooldown_remaining,
                mutations_last_hour: self.mutator.guardrails().mutation_timestamps().len(),
                max_mutations_per_hour: self.mutator.guardrails().config().max_mutations_per_hour,
            },
            last_trigger: self.store.last_trigger(),
        };
        publish(&self.shared_snapshot, snapshot);
    }
}
