use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use pulse_core::{AuditEntry, AuditOutcome};

/// Append-only mutation audit log: one JSON object per line, no pretty
/// printing. When the file exceeds the size cap it is renamed to
/// `audit.old` (replacing any prior `.old`) and a fresh file starts.
pub struct AuditLog {
    log_path: PathBuf,
    max_bytes: u64,
    count: Mutex<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditSummary {
    pub total: u64,
    pub by_kind: HashMap<String, u64>,
    pub rejected: u64,
}

impl AuditLog {
    pub fn open(dir: &Path, max_bytes: u64) -> pulse_core::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join("audit.jsonl");
        let count = if log_path.exists() {
            BufReader::new(std::fs::File::open(&log_path)?)
                .lines()
                .filter(|l| l.is_ok())
                .count() as u64
        } else {
            0
        };
        Ok(Self {
            log_path,
            max_bytes,
            count: Mutex::new(count),
        })
    }

    /// Record an applied or rejected mutation. Every attempted mutation
    /// lands here exactly once.
    pub fn record(&self, entry: &AuditEntry) -> pulse_core::Result<()> {
        self.rotate_if_needed()?;
        let line = serde_json::to_string(entry)?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        let mut count = self.count.lock();
        *count += 1;
        info!(
            n = *count,
            kind = %entry.kind,
            target = %entry.target,
            outcome = ?entry.outcome,
            rule = entry.rule.as_deref().unwrap_or("-"),
            "audit entry recorded"
        );
        Ok(())
    }

    /// The `n` most recent entries, using a bounded ring so the whole file
    /// is never held in memory.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let file = match std::fs::File::open(&self.log_path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let mut ring: VecDeque<AuditEntry> = VecDeque::with_capacity(n + 1);
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { continue };
            let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) else {
                continue;
            };
            ring.push_back(entry);
            if ring.len() > n {
                ring.pop_front();
            }
        }
        ring.into_iter().collect()
    }

    pub fn total(&self) -> u64 {
        *self.count.lock()
    }

    /// Counts by kind over the current (post-rotation) file.
    pub fn summary(&self) -> AuditSummary {
        let file = match std::fs::File::open(&self.log_path) {
            Ok(f) => f,
            Err(_) => return AuditSummary::default(),
        };
        let mut summary = AuditSummary::default();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { continue };
            let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) else {
                continue;
            };
            summary.total += 1;
            *summary.by_kind.entry(entry.kind).or_insert(0) += 1;
            if entry.outcome == AuditOutcome::Rejected {
                summary.rejected += 1;
            }
        }
        summary
    }

    fn rotate_if_needed(&self) -> pulse_core::Result<()> {
        let Ok(meta) = std::fs::metadata(&self.log_path) else {
            return Ok(());
        };
        if meta.len() <= self.max_bytes {
            return Ok(());
        }
        let old = self.log_path.with_extension("old");
        if old.exists() {
            std::fs::remove_file(&old)?;
        }
        if let Err(e) = std::fs::rename(&self.log_path, &old) {
            warn!(error = %e, "audit rotation failed");
            return Err(e.into());
        }
        *self.count.lock() = 0;
        info!(cap_bytes = self.max_bytes, "rotated audit.jsonl");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &str, outcome: AuditOutcome) -> AuditEntry {
        AuditEntry {
            timestamp: 1.0,
            kind: kind.into(),
            target: format!("drives.{kind}"),
            params: serde_json::json!({}),
            before: serde_json::Value::Null,
            after: serde_json::Value::Null,
            outcome,
            rule: None,
            reason: "test".into(),
        }
    }

    #[test]
    fn record_then_recent_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path(), 1024 * 1024).unwrap();
        log.record(&entry("adjust_weight", AuditOutcome::Applied))
            .unwrap();
        log.record(&entry("remove_drive", AuditOutcome::Rejected))
            .unwrap();

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].kind, "remove_drive");
        assert_eq!(log.total(), 2);
    }

    #[test]
    fn recent_is_bounded_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path(), 1024 * 1024).unwrap();
        for i in 0..50 {
            let mut e = entry("spike_drive", AuditOutcome::Applied);
            e.timestamp = i as f64;
            log.record(&e).unwrap();
        }
        let recent = log.recent(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].timestamp, 45.0);
        assert_eq!(recent[4].timestamp, 49.0);
    }

    #[test]
    fn one_object_per_line_no_pretty_printing() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path(), 1024 * 1024).unwrap();
        log.record(&entry("adjust_rate", AuditOutcome::Applied))
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 1);
        assert!(!raw.contains("  "));
        serde_json::from_str::<AuditEntry>(raw.lines().next().unwrap()).unwrap();
    }

    #[test]
    fn rotation_moves_to_old_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path(), 200).unwrap();
        for _ in 0..10 {
            log.record(&entry("adjust_weight", AuditOutcome::Applied))
                .unwrap();
        }
        assert!(dir.path().join("audit.old").exists());
        // Current file restarted below the cap
        let meta = std::fs::metadata(dir.path().join("audit.jsonl")).unwrap();
        assert!(meta.len() < 200 + 300);
    }

    #[test]
    fn count_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = AuditLog::open(dir.path(), 1024 * 1024).unwrap();
            log.record(&entry("add_drive", AuditOutcome::Applied))
                .unwrap();
            log.record(&entry("add_drive", AuditOutcome::Applied))
                .unwrap();
        }
        let log = AuditLog::open(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(log.total(), 2);
    }
}
