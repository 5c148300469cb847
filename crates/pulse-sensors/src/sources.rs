use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use pulse_core::SpikeDirective;

use crate::{Reading, ReadingPayload, Sensor};

/// The drive→sources mapping, shared between the daemon (which refreshes it
/// when mutations add or remove drives) and the scrape sensor.
#[derive(Clone, Default)]
pub struct SourceWatchlist {
    entries: Arc<Mutex<Vec<(String, Vec<PathBuf>)>>>,
}

impl SourceWatchlist {
    pub fn set(&self, entries: Vec<(String, Vec<PathBuf>)>) {
        *self.entries.lock() = entries;
    }

    fn get(&self) -> Vec<(String, Vec<PathBuf>)> {
        self.entries.lock().clone()
    }
}

/// Cheap mtime scan over drive source files. A watched source whose mtime
/// moved since the last tick emits a spike directive for its drive. A
/// missing file is "no change this tick", never an error. First sight of a
/// file primes the cache without spiking, so restarts don't spike.
pub struct SourceScrapeSensor {
    watchlist: SourceWatchlist,
    spike_delta: f64,
    mtime_cache: HashMap<PathBuf, f64>,
}

impl SourceScrapeSensor {
    pub fn new(watchlist: SourceWatchlist, spike_delta: f64) -> Self {
        Self {
            watchlist,
            spike_delta,
            mtime_cache: HashMap::new(),
        }
    }

    fn mtime_of(path: &PathBuf) -> Option<f64> {
        std::fs::metadata(path)
            .ok()?
            .modified()
            .ok()?
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs_f64())
    }
}

#[async_trait]
impl Sensor for SourceScrapeSensor {
    fn name(&self) -> &'static str {
        "sources"
    }

    async fn initialize(&mut self) -> pulse_core::Result<()> {
        // Prime the cache so pre-existing files don't spike on startup.
        for (_, sources) in self.watchlist.get() {
            for path in sources {
                let resolved = pulse_config::schema::expand_home(&path);
                if let Some(mtime) = Self::mtime_of(&resolved) {
                    self.mtime_cache.insert(resolved, mtime);
                }
            }
        }
        Ok(())
    }

    async fn read(&mut self, now: f64) -> pulse_core::Result<Reading> {
        let mut spikes = Vec::new();
        for (drive, sources) in self.watchlist.get() {
            for path in sources {
                let resolved = pulse_config::schema::expand_home(&path);
                let Some(mtime) = Self::mtime_of(&resolved) else {
                    continue; // missing file: no change this tick
                };
                match self.mtime_cache.insert(resolved.clone(), mtime) {
                    Some(prev) if mtime > prev => {
                        debug!(drive = %drive, source = %resolved.display(), "source changed");
                        spikes.push(SpikeDirective {
                            drive: drive.clone(),
                            delta: self.spike_delta,
                            source: resolved.to_string_lossy().to_string(),
                        });
                    }
                    Some(_) => {}
                    None => {} // first sight primes only
                }
            }
        }
        Ok(Reading {
            timestamp: now,
            payload: ReadingPayload::Sources,
            spikes,
        })
    }

    async fn stop(&mut self) {}
}
