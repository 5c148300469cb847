use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use pulse_config::schema::{ConversationSensorConfig, RulesConfig};
use pulse_core::ConversationReading;

use crate::{Reading, ReadingPayload, Sensor};

/// Detects when a human is actively talking to the agent.
///
/// Source of truth: the mtime of the largest transcript over the size floor
/// in each configured session directory. Small transcripts are cron/hook
/// session noise and are ignored; only the main session represents human
/// conversation. Activity and cooldown windows both come from the rules
/// config, the same knobs the evaluator suppresses on.
pub struct ConversationSensor {
    cfg: ConversationSensorConfig,
    activity_threshold_secs: f64,
    cooldown_secs: f64,
    last_human_activity: f64,
}

impl ConversationSensor {
    pub fn new(cfg: ConversationSensorConfig, rules: &RulesConfig) -> Self {
        Self {
            cfg,
            activity_threshold_secs: rules.activity_threshold_secs as f64,
            cooldown_secs: rules.conversation_cooldown_secs as f64,
            last_human_activity: 0.0,
        }
    }

    /// Mtime (epoch seconds) of the largest qualifying transcript, if any.
    fn main_transcript_mtime(&self) -> Option<f64> {
        for dir in &self.cfg.session_dirs {
            let resolved = pulse_config::schema::expand_home(dir);
            let Ok(entries) = std::fs::read_dir(&resolved) else {
                continue;
            };
            let mut largest: Option<(u64, f64)> = None;
            for entry in entries.flatten() {
                let path: PathBuf = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_file() || meta.len() < self.cfg.min_transcript_bytes {
                    continue;
                }
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs_f64())
                    .unwrap_or(0.0);
                if largest.is_none_or(|(size, _)| meta.len() > size) {
                    largest = Some((meta.len(), mtime));
                }
            }
            if let Some((_, mtime)) = largest {
                return Some(mtime);
            }
        }
        None
    }
}

#[async_trait]
impl Sensor for ConversationSensor {
    fn name(&self) -> &'static str {
        "conversation"
    }

    async fn initialize(&mut self) -> pulse_core::Result<()> {
        for dir in &self.cfg.session_dirs {
            let resolved = pulse_config::schema::expand_home(dir);
            if resolved.exists() {
                info!(dir = %resolved.display(), "conversation sensor watching");
            } else {
                debug!(dir = %resolved.display(), "session directory absent");
            }
        }
        Ok(())
    }

    async fn read(&mut self, now: f64) -> pulse_core::Result<Reading> {
        if let Some(mtime) = self.main_transcript_mtime() {
            if mtime > self.last_human_activity {
                self.last_human_activity = mtime;
            }
        }

        let (active, in_cooldown, seconds_since) = if self.last_human_activity > 0.0 {
            let since = (now - self.last_human_activity).max(0.0);
            (
                since < self.activity_threshold_secs,
                since < self.cooldown_secs,
                Some(since),
            )
        } else {
            (false, false, None)
        };

        Ok(Reading {
            timestamp: now,
            payload: ReadingPayload::Conversation(ConversationReading {
                active,
                in_cooldown,
                seconds_since_last_message: seconds_since,
            }),
            spikes: Vec::new(),
        })
    }

    async fn stop(&mut self) {}
}
