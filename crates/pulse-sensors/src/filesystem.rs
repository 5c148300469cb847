use async_trait::async_trait;
use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use pulse_config::schema::FilesystemSensorConfig;
use pulse_core::{FileChange, FileChangeKind, FilesystemReading, PulseError};

use crate::{Reading, ReadingPayload, Sensor};

/// Paths the daemon wrote itself, compared after resolution (symlinks,
/// normalized form). Entries are drained on match so one registration
/// swallows exactly one event. Shared between the daemon (writer side) and
/// the watcher callback (reader side).
#[derive(Clone, Default)]
pub struct SelfWriteRegistry {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl SelfWriteRegistry {
    pub fn mark(&self, path: &Path) {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.paths.lock().insert(resolved);
    }

    /// True when `path` was registered as a self-write; the entry is
    /// consumed.
    fn should_ignore(&self, path: &Path) -> bool {
        let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.paths.lock().remove(&resolved)
    }
}

/// Event-driven filesystem sensor: a `notify` watcher buffers changes on
/// its own thread, and `read()` drains the buffer since last tick,
/// deduplicated to the last event per path.
pub struct FilesystemSensor {
    cfg: FilesystemSensorConfig,
    buffer: Arc<Mutex<Vec<FileChange>>>,
    self_writes: SelfWriteRegistry,
    watcher: Option<notify::RecommendedWatcher>,
}

impl FilesystemSensor {
    pub fn new(cfg: FilesystemSensorConfig) -> Self {
        Self {
            cfg,
            buffer: Arc::new(Mutex::new(Vec::new())),
            self_writes: SelfWriteRegistry::default(),
            watcher: None,
        }
    }

    pub fn self_writes(&self) -> SelfWriteRegistry {
        self.self_writes.clone()
    }

    fn matches_ignore(patterns: &[String], path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let full = path.to_string_lossy();
        patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                name.ends_with(suffix) || full.ends_with(suffix)
            } else {
                full.contains(pattern.as_str())
            }
        })
    }
}

#[async_trait]
impl Sensor for FilesystemSensor {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn initialize(&mut self) -> pulse_core::Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let buffer = Arc::clone(&self.buffer);
        let self_writes = self.self_writes.clone();
        let ignore_self = self.cfg.ignore_self_writes;
        let patterns = self.cfg.ignore_patterns.clone();

        let mut watcher = notify::recommended_watcher(
            move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    let kind = match event.kind {
                        EventKind::Create(_) => FileChangeKind::Created,
                        EventKind::Modify(_) => FileChangeKind::Modified,
                        EventKind::Remove(_) => FileChangeKind::Deleted,
                        _ => return,
                    };
                    for path in event.paths {
                        if path.is_dir() {
                            continue;
                        }
                        if FilesystemSensor::matches_ignore(&patterns, &path) {
                            continue;
                        }
                        if ignore_self && self_writes.should_ignore(&path) {
                            continue;
                        }
                        buffer.lock().push(FileChange {
                            path: path.to_string_lossy().to_string(),
                            kind,
                        });
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            },
        )
        .map_err(|e| PulseError::Sensor {
            sensor: "filesystem".into(),
            reason: e.to_string(),
        })?;

        let mut watched = 0usize;
        for path in &self.cfg.watch_paths {
            let resolved = pulse_config::schema::expand_home(path);
            if resolved.exists() {
                watcher
                    .watch(&resolved, RecursiveMode::Recursive)
                    .map_err(|e| PulseError::Sensor {
                        sensor: "filesystem".into(),
                        reason: e.to_string(),
                    })?;
                watched += 1;
            } else {
                warn!(path = %resolved.display(), "watch path does not exist");
            }
        }
        self.watcher = Some(watcher);
        info!(watched, "filesystem sensor watching");
        Ok(())
    }

    async fn read(&mut self, now: f64) -> pulse_core::Result<Reading> {
        let drained: Vec<FileChange> = std::mem::take(&mut *self.buffer.lock());
        // Keep the last event per path.
        let mut last: HashMap<String, FileChange> = HashMap::new();
        for change in drained {
            last.insert(change.path.clone(), change);
        }
        let changes: Vec<FileChange> = last.into_values().collect();
        if !changes.is_empty() {
            debug!(count = changes.len(), "filesystem changes detected");
        }
        Ok(Reading {
            timestamp: now,
            payload: ReadingPayload::Filesystem(FilesystemReading { changes }),
            spikes: Vec::new(),
        })
    }

    async fn stop(&mut self) {
        self.watcher = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_patterns_match_name_and_substring() {
        let patterns = vec![".git".to_string(), "*.tmp".to_string()];
        assert!(FilesystemSensor::matches_ignore(
            &patterns,
            Path::new("/repo/.git/HEAD")
        ));
        assert!(FilesystemSensor::matches_ignore(
            &patterns,
            Path::new("/tmp/scratch.tmp")
        ));
        assert!(!FilesystemSensor::matches_ignore(
            &patterns,
            Path::new("/repo/src/main.rs")
        ));
    }

    #[test]
    fn self_write_registry_drains_on_match() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("state.json");
        std::fs::write(&file, "{}").unwrap();

        let registry = SelfWriteRegistry::default();
        registry.mark(&file);
        assert!(registry.should_ignore(&file));
        // Consumed — the next event for the same path is real.
        assert!(!registry.should_ignore(&file));
    }

    #[tokio::test]
    async fn read_drains_and_dedups_buffer() {
        let mut sensor = FilesystemSensor::new(FilesystemSensorConfig::default());
        {
            let mut buf = sensor.buffer.lock();
            buf.push(FileChange {
                path: "/a".into(),
                kind: FileChangeKind::Created,
            });
            buf.push(FileChange {
                path: "/a".into(),
                kind: FileChangeKind::Modified,
            });
            buf.push(FileChange {
                path: "/b".into(),
                kind: FileChangeKind::Deleted,
            });
        }
        let reading = sensor.read(0.0).await.unwrap();
        let ReadingPayload::Filesystem(fs) = reading.payload else {
            panic!("wrong payload")
        };
        assert_eq!(fs.changes.len(), 2);
        let a = fs.changes.iter().find(|c| c.path == "/a").unwrap();
        assert_eq!(a.kind, FileChangeKind::Modified);

        // Buffer drained.
        let reading = sensor.read(1.0).await.unwrap();
        let ReadingPayload::Filesystem(fs) = reading.payload else {
            panic!("wrong payload")
        };
        assert!(fs.changes.is_empty());
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FilesystemSensorConfig {
            enabled: true,
            watch_paths: vec![dir.path().to_path_buf()],
            ignore_patterns: vec![],
            ignore_self_writes: true,
        };
        let mut sensor = FilesystemSensor::new(cfg);
        sensor.initialize().await.unwrap();
        sensor.initialize().await.unwrap();
        sensor.stop().await;
    }
}
