use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pulse_config::{ConfigLoader, PulseConfig};
use pulse_core::PulseError;
use pulse_daemon::PulseDaemon;

#[derive(Parser)]
#[command(
    name = "pulse",
    about = "Self-initiated initiative daemon for an external agent",
    version
)]
pub struct Cli {
    /// Path to pulse.toml (default: ./pulse.toml, then ~/.pulse/pulse.toml).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Shortcut for --log-level debug.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon in the foreground.
    Start,
    /// Liveness summary of a running daemon.
    Status,
    /// Full state snapshot of a running daemon.
    State,
    /// Effective configuration (local file + defaults).
    Config,
    /// Force a trigger, subject to cooldown and the hourly cap.
    Trigger,
    /// Report which drives a turn addressed.
    Feedback {
        /// Drive names, comma-separated.
        #[arg(long, value_delimiter = ',')]
        drives: Vec<String>,
        /// "success", "partial", or "failure".
        #[arg(long, default_value = "success")]
        outcome: String,
        #[arg(long, default_value = "")]
        summary: String,
    },
    /// Submit a mutation as a JSON object.
    Mutate {
        /// e.g. '{"type": "adjust_weight", "drive": "curiosity", "value": 0.8, "reason": "..."}'
        json: String,
    },
    /// Recent mutation audit entries.
    Mutations {
        #[arg(long, default_value_t = 20)]
        n: usize,
    },
}

impl Cli {
    pub async fn run(self) -> pulse_core::Result<()> {
        let loader = ConfigLoader::load(self.config.as_deref())?;
        let config = loader.get();

        let log_level = if self.verbose {
            "debug"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
        if config.logging.format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_target(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }

        match self.command {
            Commands::Start => PulseDaemon::new(config).run().await,
            Commands::Status => Self::cmd_status(&config).await,
            Commands::State => Self::cmd_get_json(&config, "/state").await,
            Commands::Config => Self::cmd_config(&config),
            Commands::Trigger => Self::cmd_trigger(&config).await,
            Commands::Feedback {
                drives,
                outcome,
                summary,
            } => Self::cmd_feedback(&config, drives, outcome, summary).await,
            Commands::Mutate { json } => Self::cmd_mutate(&config, json).await,
            Commands::Mutations { n } => {
                Self::cmd_get_json(&config, &format!("/mutations?n={n}")).await
            }
        }
    }

    fn base_url(config: &PulseConfig) -> String {
        format!(
            "http://{}:{}",
            config.daemon.health_host, config.daemon.health_port
        )
    }

    async fn cmd_status(config: &PulseConfig) -> pulse_core::Result<()> {
        let base = Self::base_url(config);
        let health: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .map_err(|e| PulseError::Webhook(format!("daemon unreachable: {e}")))?
            .json()
            .await
            .map_err(|e| PulseError::Webhook(e.to_string()))?;
        println!(
            "pulse {} — {} (up {}s)",
            health["version"].as_str().unwrap_or("?"),
            health["status"].as_str().unwrap_or("?"),
            health["uptime_s"]
        );

        let state: serde_json::Value = reqwest::get(format!("{base}/state"))
            .await
            .map_err(|e| PulseError::Webhook(e.to_string()))?
            .json()
            .await
            .map_err(|e| PulseError::Webhook(e.to_string()))?;
        println!(
            "total pressure {:.3} (threshold {}), turns dispatched {}",
            state["total_pressure"].as_f64().unwrap_or(0.0),
            state["config"]["trigger_threshold"],
            state["turn_count"]
        );
        if let Some(drives) = state["drives"].as_array() {
            for d in drives {
                println!(
                    "  {:<12} pressure {:>6.3}  weight {:>5.2}{}",
                    d["name"].as_str().unwrap_or("?"),
                    d["pressure"].as_f64().unwrap_or(0.0),
                    d["weight"].as_f64().unwrap_or(0.0),
                    if d["protected"].as_bool().unwrap_or(false) {
                        "  (protected)"
                    } else {
                        ""
                    }
                );
            }
        }
        Ok(())
    }

    async fn cmd_get_json(config: &PulseConfig, path: &str) -> pulse_core::Result<()> {
        let base = Self::base_url(config);
        let body: serde_json::Value = reqwest::get(format!("{base}{path}"))
            .await
            .map_err(|e| PulseError::Webhook(format!("daemon unreachable: {e}")))?
            .json()
            .await
            .map_err(|e| PulseError::Webhook(e.to_string()))?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        Ok(())
    }

    fn cmd_config(config: &PulseConfig) -> pulse_core::Result<()> {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| PulseError::Config(e.to_string()))?;
        println!("{rendered}");
        Ok(())
    }

    async fn cmd_trigger(config: &PulseConfig) -> pulse_core::Result<()> {
        let base = Self::base_url(config);
        let resp = reqwest::Client::new()
            .post(format!("{base}/trigger"))
            .send()
            .await
            .map_err(|e| PulseError::Webhook(format!("daemon unreachable: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        match status.as_u16() {
            200 => println!("trigger dispatched ({})", body["webhook_status"]),
            429 => println!("trigger refused: rate limited"),
            _ => println!("trigger failed ({status}): {body}"),
        }
        Ok(())
    }

    async fn cmd_feedback(
        config: &PulseConfig,
        drives: Vec<String>,
        outcome: String,
        summary: String,
    ) -> pulse_core::Result<()> {
        let base = Self::base_url(config);
        let resp = reqwest::Client::new()
            .post(format!("{base}/feedback"))
            .json(&serde_json::json!({
                "drives_addressed": drives,
                "outcome": outcome,
                "summary": summary,
            }))
            .send()
            .await
            .map_err(|e| PulseError::Webhook(format!("daemon unreachable: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        if status.is_success() {
            println!("{}", serde_json::to_string_pretty(&body["drives_updated"])?);
            Ok(())
        } else {
            Err(PulseError::Validation(format!(
                "feedback rejected ({status}): {body}"
            )))
        }
    }

    async fn cmd_mutate(config: &PulseConfig, json: String) -> pulse_core::Result<()> {
        let value: serde_json::Value = serde_json::from_str(&json)
            .map_err(|e| PulseError::Validation(format!("not valid JSON: {e}")))?;
        let base = Self::base_url(config);
        let resp = reqwest::Client::new()
            .post(format!("{base}/config"))
            .json(&value)
            .send()
            .await
            .map_err(|e| PulseError::Webhook(format!("daemon unreachable: {e}")))?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        match status.as_u16() {
            200 => println!(
                "applied: {} {} → {}",
                body["target"].as_str().unwrap_or("?"),
                body["before"],
                body["after"]
            ),
            400 => println!(
                "rejected by rule '{}': {}",
                body["rule"].as_str().unwrap_or("?"),
                serde_json::to_string(&body["params"])?
            ),
            403 => println!("mutations are disabled on this daemon"),
            _ => println!("unexpected response ({status}): {body}"),
        }
        Ok(())
    }
}
