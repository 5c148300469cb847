use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use pulse_config::schema::ModelEvalConfig;
use pulse_config::PulseConfig;
use pulse_core::{DriveState, PulseError, SensorSnapshot, SharedTunables, TriggerDecision};

use crate::rules::RuleEvaluator;
use crate::Evaluator;

const MAX_HISTORY: usize = 20;

const SYSTEM_PROMPT: &str = "\
You are the trigger gate for an autonomous agent daemon. Your only job is to \
decide: should the agent wake up and think right now?

You receive drive states (internal motivations with pressure levels), sensor \
readings, recent trigger history, and the agent's working memory.

Respond with ONLY valid JSON (no markdown, no explanation):
{
  \"trigger\": true/false,
  \"reason\": \"one sentence\",
  \"suggested_focus\": \"what to focus on if triggered\",
  \"suppress_minutes\": 0
}

Rules:
- trigger=true ONLY when there is a specific, actionable task right now.
- trigger=false is the default. When in doubt, don't trigger.
- Sensor changes (new files, system alerts) are the strongest signals; pure \
time passage with no new information means suppress, don't trigger.
- If you declined, set suppress_minutes to 10-30 to avoid rapid re-evaluation.
- Never suggest focusing on work the working memory marks complete.";

/// Per-call result parsed out of the model's JSON reply. Unknown fields are
/// tolerated — small models embellish.
#[derive(Debug, Deserialize)]
struct ModelReply {
    #[serde(default)]
    trigger: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    suggested_focus: String,
    #[serde(default)]
    suppress_minutes: u64,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    timestamp: f64,
    reason: String,
    pressure: f64,
    success: bool,
}

/// LLM-powered evaluation gate against any OpenAI-compatible chat API.
///
/// After `max_consecutive_failures` (timeout, network, unparseable output)
/// it degrades to the rule evaluator, probing the model again every
/// `recovery_interval_secs`; a single success restores model mode. The
/// high-pressure override and conversation suppression are hard rules the
/// model can neither cause nor veto.
pub struct ModelEvaluator {
    cfg: ModelEvalConfig,
    client: reqwest::Client,
    fallback: RuleEvaluator,
    working_memory: Option<PathBuf>,
    consecutive_failures: u32,
    last_failure_at: f64,
    suppress_until: f64,
    history: VecDeque<HistoryEntry>,
}

impl ModelEvaluator {
    pub fn new(config: &PulseConfig, tunables: SharedTunables) -> Self {
        let cfg = config.evaluator.model.clone();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            cfg,
            client,
            fallback: RuleEvaluator::new(config, tunables),
            working_memory: config.workspace.working_memory.clone(),
            consecutive_failures: 0,
            last_failure_at: 0.0,
            suppress_until: 0.0,
            history: VecDeque::new(),
        }
    }

    async fn call_model(&self, prompt: String) -> pulse_core::Result<String> {
        let url = format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.cfg.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": self.cfg.max_tokens,
            "temperature": self.cfg.temperature,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PulseError::EvaluatorTimeout {
                        timeout_secs: self.cfg.timeout_secs,
                    }
                } else {
                    PulseError::Evaluator(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(PulseError::Evaluator(format!(
                "model API returned {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PulseError::Evaluator(e.to_string()))?;
        data["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| PulseError::Evaluator("model response missing content".into()))
    }

    fn parse_reply(raw: &str) -> pulse_core::Result<ModelReply> {
        // Strip markdown fences if present.
        let mut cleaned = raw.trim();
        if let Some(rest) = cleaned.strip_prefix("```") {
            cleaned = rest
                .trim_start_matches("json")
                .trim_end_matches("```")
                .trim();
        }
        serde_json::from_str(cleaned)
            .map_err(|e| PulseError::Evaluator(format!("unparseable model reply: {e}")))
    }

    fn build_prompt(
        &self,
        drives: &DriveState,
        sensors: &SensorSnapshot,
        now: f64,
    ) -> String {
        let mut parts = Vec::new();

        parts.push("## Time".to_string());
        parts.push(format!(
            "Current time: {}",
            chrono::Local::now().format("%A, %B %d, %Y — %H:%M")
        ));
        parts.push(String::new());

        parts.push("## Drive States".to_string());
        let mut sorted: Vec<_> = drives.drives.iter().collect();
        sorted.sort_by(|a, b| {
            b.weighted_pressure()
                .partial_cmp(&a.weighted_pressure())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for d in sorted {
            let last = if d.last_addressed > 0.0 {
                format!(" (last addressed {:.0}m ago)", (now - d.last_addressed) / 60.0)
            } else {
                String::new()
            };
            parts.push(format!(
                "- {}: {:.2} (weight {:.2}){last}",
                d.name, d.pressure, d.weight
            ));
        }
        parts.push(format!(
            "- Combined pressure: {:.2}",
            drives.total_pressure
        ));
        parts.push(String::new());

        parts.push("## Sensors".to_string());
        if sensors.filesystem.changes.is_empty() {
            parts.push("File changes: none".to_string());
        } else {
            parts.push(format!(
                "File changes ({}):",
                sensors.filesystem.changes.len()
            ));
            for c in sensors.filesystem.changes.iter().take(10) {
                parts.push(format!("  - {:?}: {}", c.kind, c.path));
            }
        }
        if sensors.conversation.active {
            parts.push("Human conversation ACTIVE".to_string());
        } else if sensors.conversation.in_cooldown {
            parts.push("Human conversation cooldown".to_string());
        } else {
            parts.push("Human conversation: inactive".to_string());
        }
        if sensors.system.alerts.is_empty() {
            parts.push("System alerts: none".to_string());
        } else {
            parts.push(format!(
                "System alerts: {}",
                serde_json::to_string(&sensors.system.alerts).unwrap_or_default()
            ));
        }
        parts.push(String::new());

        if !self.history.is_empty() {
            parts.push("## Recent Trigger History".to_string());
            for entry in self.history.iter().rev().take(5) {
                let status = if entry.success { "ok" } else { "failed" };
                parts.push(format!(
                    "- {:.0}m ago: {status} — {} (pressure {:.2})",
                    (now - entry.timestamp) / 60.0,
                    entry.reason,
                    entry.pressure
                ));
            }
            parts.push(String::new());
        }

        if let Some(path) = &self.working_memory {
            if let Ok(raw) = std::fs::read_to_string(path) {
                parts.push("## Working Memory".to_string());
                let truncated: String = raw.chars().take(500).collect();
                parts.push(truncated);
            }
        }

        parts.join("\n")
    }
}

#[async_trait]
impl Evaluator for ModelEvaluator {
    async fn decide(
        &mut self,
        drives: &DriveState,
        sensors: &SensorSnapshot,
        now: f64,
    ) -> TriggerDecision {
        // Hard rules the model never sees and never overrides.
        if let Some(suppressed) = self.fallback.conversation_suppressed(drives, sensors) {
            return suppressed;
        }
        if let Some(decision) = self.fallback.high_pressure_override(drives, sensors) {
            return decision;
        }

        if now < self.suppress_until {
            debug!(
                remaining_secs = (self.suppress_until - now) as u64,
                "decision suppressed by evaluator"
            );
            return TriggerDecision::no_trigger("suppressed by evaluator", drives);
        }

        // While degraded, delegate to rules and probe the model on an interval.
        if self.degraded() && now - self.last_failure_at < self.cfg.recovery_interval_secs as f64
        {
            return self.fallback.decide(drives, sensors, now).await;
        }
        if self.degraded() {
            info!("retrying model evaluator after recovery interval");
        }

        let prompt = self.build_prompt(drives, sensors, now);
        match self.call_model(prompt).await {
            Ok(raw) => match Self::parse_reply(&raw) {
                Ok(reply) => {
                    if self.consecutive_failures > 0 {
                        info!("model evaluator recovered");
                    }
                    self.consecutive_failures = 0;

                    let mut decision = if reply.trigger {
                        let reason = if reply.suggested_focus.is_empty() {
                            format!("model: {}", reply.reason)
                        } else {
                            format!("model: {} — focus: {}", reply.reason, reply.suggested_focus)
                        };
                        TriggerDecision::trigger(reason, drives)
                    } else {
                        TriggerDecision::no_trigger(format!("model: {}", reply.reason), drives)
                    };
                    decision.sensor_context = reply.suggested_focus;

                    if !decision.should_trigger && reply.suppress_minutes > 0 {
                        let capped = reply.suppress_minutes.min(self.cfg.max_suppress_minutes);
                        self.suppress_until = now + capped as f64 * 60.0;
                        decision.suppress_for =
                            Some(Duration::from_secs(capped * 60));
                        debug!(suppress_minutes = capped, "model requested suppression");
                    }
                    decision
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    self.last_failure_at = now;
                    warn!(
                        failures = self.consecutive_failures,
                        error = %e,
                        "model evaluator parse failure"
                    );
                    self.fallback.decide(drives, sensors, now).await
                }
            },
            Err(e) => {
                self.consecutive_failures += 1;
                self.last_failure_at = now;
                warn!(
                    failures = self.consecutive_failures,
                    error = %e,
                    "model evaluator call failure"
                );
                self.fallback.decide(drives, sensors, now).await
            }
        }
    }

    fn mode(&self) -> &'static str {
        "model"
    }

    fn degraded(&self) -> bool {
        self.consecutive_failures >= self.cfg.max_consecutive_failures
    }

    fn record_trigger(&mut self, decision: &TriggerDecision, success: bool) {
        self.history.push_back(HistoryEntry {
            timestamp: chrono::Utc::now().timestamp() as f64,
            reason: decision.reason.clone(),
            pressure: decision.total_pressure,
            success,
        });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }
}
