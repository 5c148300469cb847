use fd_lock::{RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use pulse_core::PulseError;

/// Exclusive per-state-directory process lock backed by `pulse.pid`.
///
/// The advisory lock is held for the daemon's lifetime and released by the
/// OS when the file descriptor closes, so a killed daemon never leaves the
/// directory locked. The recorded PID exists for diagnostics: when
/// acquisition fails we report who holds the lock, and a stale PID (no such
/// process, lock not held) is simply overwritten.
pub struct ProcessLock {
    lock: RwLock<File>,
    path: PathBuf,
}

impl ProcessLock {
    pub fn new(dir: &Path) -> pulse_core::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("pulse.pid");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            lock: RwLock::new(file),
            path,
        })
    }

    /// Try to take the lock and record our PID. The returned guard must be
    /// held for the daemon's lifetime; dropping it releases the directory.
    pub fn acquire(&mut self) -> pulse_core::Result<RwLockWriteGuard<'_, File>> {
        let path = self.path.clone();
        match self.lock.try_write() {
            Ok(mut guard) => {
                let pid = std::process::id();
                guard.set_len(0)?;
                guard.seek(SeekFrom::Start(0))?;
                write!(*guard, "{pid}")?;
                guard.flush()?;
                info!(path = %path.display(), pid, "acquired state-directory lock");
                Ok(guard)
            }
            Err(_) => {
                let holder = read_recorded_pid(&path);
                match holder {
                    Some(pid) if pid_is_alive(pid) => {
                        warn!(path = %path.display(), pid, "state directory is held by a live daemon");
                        Err(PulseError::StateLocked { pid })
                    }
                    _ => {
                        // flock is free only when the holder is gone, so a
                        // contended lock with a dead recorded PID means the
                        // recording raced; report it as locked anyway.
                        Err(PulseError::StateLocked {
                            pid: holder.unwrap_or(0),
                        })
                    }
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_recorded_pid(path: &Path) -> Option<u32> {
    let mut raw = String::new();
    File::open(path).ok()?.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_records_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = ProcessLock::new(dir.path()).unwrap();
        let _guard = lock.acquire().unwrap();
        let recorded = read_recorded_pid(&dir.path().join("pulse.pid")).unwrap();
        assert_eq!(recorded, std::process::id());
    }

    #[test]
    fn second_lock_in_same_process_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = ProcessLock::new(dir.path()).unwrap();
        let _guard = first.acquire().unwrap();

        let mut second = ProcessLock::new(dir.path()).unwrap();
        assert!(second.acquire().is_err());
    }

    #[test]
    fn lock_is_reacquirable_after_release() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut lock = ProcessLock::new(dir.path()).unwrap();
            let _guard = lock.acquire().unwrap();
        }
        let mut lock = ProcessLock::new(dir.path()).unwrap();
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn stale_pid_file_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pulse.pid"), "999999999").unwrap();
        let mut lock = ProcessLock::new(dir.path()).unwrap();
        assert!(lock.acquire().is_ok());
    }
}
