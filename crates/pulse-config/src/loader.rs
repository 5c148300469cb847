use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::PulseConfig;

/// Loads the Pulse configuration from `pulse.toml`.
pub struct ConfigLoader {
    config: PulseConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > PULSE_CONFIG env > ./pulse.toml > ~/.pulse/pulse.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("PULSE_CONFIG") {
            return PathBuf::from(p);
        }
        let local = PathBuf::from("pulse.toml");
        if local.exists() {
            return local;
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pulse")
            .join("pulse.toml")
    }

    /// Load the config from disk, falling back to defaults when the file is
    /// absent. Validation errors abort the load; warnings are logged.
    pub fn load(path: Option<&Path>) -> pulse_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<PulseConfig>(&raw).map_err(|e| {
                pulse_core::PulseError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            PulseConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(pulse_core::PulseError::Config(e));
            }
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    pub fn get(&self) -> PulseConfig {
        self.config.clone()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides. The token override matters most: secrets
    /// belong in the environment, not the config file.
    fn apply_env_overrides(mut config: PulseConfig) -> PulseConfig {
        if config.webhook.token.is_empty() {
            if let Ok(v) = std::env::var("PULSE_HOOK_TOKEN") {
                config.webhook.token = v;
            }
        }
        if let Ok(v) = std::env::var("PULSE_WEBHOOK_URL") {
            config.webhook.url = v;
        }
        if let Ok(v) = std::env::var("PULSE_HEALTH_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                config.daemon.health_port = port;
            }
        }
        if let Ok(v) = std::env::var("PULSE_STATE_DIR") {
            config.state.dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PULSE_LOG_LEVEL") {
            config.logging.level = v;
        }
        config
    }
}
