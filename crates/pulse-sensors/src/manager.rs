use tracing::{info, warn};

use pulse_config::PulseConfig;
use pulse_core::SensorSnapshot;

use crate::conversation::ConversationSensor;
use crate::filesystem::{FilesystemSensor, SelfWriteRegistry};
use crate::sources::{SourceScrapeSensor, SourceWatchlist};
use crate::system::SystemSensor;
use crate::{ReadingPayload, Sensor};

/// Coordinates all sensors and merges their readings into one
/// [`SensorSnapshot`] per tick. A sensor failure is logged and contributes
/// an empty reading — one broken sensor never takes the loop down.
pub struct SensorManager {
    sensors: Vec<Box<dyn Sensor>>,
    self_writes: SelfWriteRegistry,
    watchlist: SourceWatchlist,
}

impl SensorManager {
    pub fn from_config(config: &PulseConfig) -> Self {
        let mut sensors: Vec<Box<dyn Sensor>> = Vec::new();
        let mut self_writes = SelfWriteRegistry::default();

        if config.sensors.filesystem.enabled {
            let fs = FilesystemSensor::new(config.sensors.filesystem.clone());
            self_writes = fs.self_writes();
            sensors.push(Box::new(fs));
        }
        // Conversation sensor is always on — it feeds trigger suppression.
        sensors.push(Box::new(ConversationSensor::new(
            config.sensors.conversation.clone(),
            &config.evaluator.rules,
        )));
        if config.sensors.system.enabled {
            sensors.push(Box::new(SystemSensor::new(config.sensors.system.clone())));
        }

        let watchlist = SourceWatchlist::default();
        sensors.push(Box::new(SourceScrapeSensor::new(
            watchlist.clone(),
            config.drives.source_spike,
        )));

        Self {
            sensors,
            self_writes,
            watchlist,
        }
    }

    pub async fn initialize(&mut self) -> pulse_core::Result<()> {
        for sensor in &mut self.sensors {
            sensor.initialize().await?;
        }
        info!(count = self.sensors.len(), "sensors started");
        Ok(())
    }

    pub async fn stop(&mut self) {
        for sensor in &mut self.sensors {
            sensor.stop().await;
        }
        info!("all sensors stopped");
    }

    /// Handle for registering daemon self-writes with the filesystem sensor.
    pub fn self_writes(&self) -> SelfWriteRegistry {
        self.self_writes.clone()
    }

    /// Handle for refreshing the drive→sources scrape list.
    pub fn source_watchlist(&self) -> SourceWatchlist {
        self.watchlist.clone()
    }

    /// Read every sensor and merge. Failures become empty readings.
    pub async fn read_all(&mut self, now: f64) -> SensorSnapshot {
        let mut snapshot = SensorSnapshot {
            timestamp: now,
            ..Default::default()
        };
        for sensor in &mut self.sensors {
            match sensor.read(now).await {
                Ok(reading) => {
                    snapshot.spikes.extend(reading.spikes);
                    match reading.payload {
                        ReadingPayload::Filesystem(fs) => snapshot.filesystem = fs,
                        ReadingPayload::Conversation(c) => snapshot.conversation = c,
                        ReadingPayload::System(s) => snapshot.system = s,
                        ReadingPayload::Sources => {}
                    }
                }
                Err(e) => {
                    warn!(sensor = sensor.name(), error = %e, "sensor read failed");
                }
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manager_merges_readings() {
        let mut config = PulseConfig::default();
        config.sensors.filesystem.enabled = false; // no watcher thread in tests
        config.sensors.system.enabled = true;
        config.sensors.system.memory_threshold_mb = 0;

        let mut manager = SensorManager::from_config(&config);
        manager.initialize().await.unwrap();
        let snapshot = manager.read_all(1000.0).await;
        assert_eq!(snapshot.timestamp, 1000.0);
        assert!(!snapshot.conversation.active);
        manager.stop().await;
    }

    #[tokio::test]
    async fn watchlist_flows_to_scrape_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        std::fs::write(&file, "v1").unwrap();

        let mut config = PulseConfig::default();
        config.sensors.filesystem.enabled = false;
        config.sensors.system.enabled = false;

        let mut manager = SensorManager::from_config(&config);
        manager
            .source_watchlist()
            .set(vec![("curiosity".into(), vec![file.clone()])]);
        manager.initialize().await.unwrap();

        let _ = manager.read_all(0.0).await;
        let newer = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let f = std::fs::File::options().write(true).open(&file).unwrap();
        f.set_modified(newer).unwrap();

        let snapshot = manager.read_all(1.0).await;
        assert_eq!(snapshot.spikes.len(), 1);
        assert_eq!(snapshot.spikes[0].drive, "curiosity");
    }
}
