//! Single-writer-per-workflow run locks.
//!
//! A lock is a file `{dir}/{workflow}.lock` created with `create_new`, so
//! only one process can win it. The file body is a JSON [`LockRecord`]
//! carrying the holder's run id and liveness metadata (pid, hostname,
//! acquisition time).
//!
//! A stale lock is reclaimed by renaming it to a private tombstone first.
//! Only the process whose rename succeeds gets to compare the tombstone
//! with what it judged stale; if a fresh holder slipped in meanwhile, the
//! file is linked back and the reclaim is abandoned.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use weave_core::config::{LockConfig, LockLiveness, StateConfig};
use weave_core::error::{Result, WeaveError};
use weave_core::types::RunId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub workflow: String,
    pub run_id: RunId,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn new(workflow: &str, run_id: &RunId) -> Self {
        Self {
            workflow: workflow.to_string(),
            run_id: run_id.clone(),
            pid: std::process::id(),
            hostname: local_hostname(),
            acquired_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Current holder of a workflow lock as seen by [`LockManager::inspect`].
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub path: PathBuf,
    pub record: LockRecord,
    pub stale: bool,
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} held by run {} (pid {} on {}, {}s old{})",
            self.record.workflow,
            self.record.run_id,
            self.record.pid,
            self.record.hostname,
            self.record.age().as_secs(),
            if self.stale { ", STALE" } else { "" }
        )
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Liveness check for a pid on this host. `None` when the platform offers
/// no cheap way to tell.
fn process_alive(pid: u32) -> Option<bool> {
    let proc_root = Path::new("/proc");
    if !proc_root.is_dir() {
        return None;
    }
    Some(proc_root.join(pid.to_string()).exists())
}

/// Collision-free file name component for a workflow or run name.
///
/// `[A-Za-z0-9_-]` pass through; every other byte, `.` and `%` included,
/// becomes `%XX`. Distinct names therefore never share a file, and the
/// result can never be `.`, `..` or contain a separator.
pub(crate) fn file_safe_name(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn lock_file_name(workflow: &str) -> String {
    format!("{}.lock", file_safe_name(workflow))
}

pub struct LockManager {
    dir: PathBuf,
    liveness: LockLiveness,
    stale_after: Duration,
    grace: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, config: &LockConfig) -> Self {
        Self {
            dir: dir.into(),
            liveness: config.liveness,
            stale_after: config.stale_after_duration(),
            grace: config.grace_duration(),
        }
    }

    /// Locks live under `{state.dir}/locks`.
    pub fn from_config(state: &StateConfig) -> Self {
        Self::new(state.state_dir().join("locks"), &state.lock)
    }

    pub fn lock_path(&self, workflow: &str) -> PathBuf {
        self.dir.join(lock_file_name(workflow))
    }

    fn read_record(path: &Path) -> Option<LockRecord> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Move a stale lock out of the way, but only if it is still the file
    /// that was judged stale. `seen` is the body read at that time.
    ///
    /// Returns `true` when the lock path is free for another `create_new`.
    fn reclaim(&self, path: &Path, seen: Option<&str>, run_id: &RunId) -> Result<bool> {
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        let tombstone = path.with_file_name(format!(
            ".{}.{}.{}.stale",
            file,
            std::process::id(),
            file_safe_name(run_id.as_str())
        ));

        match fs::rename(path, &tombstone) {
            Ok(()) => {}
            // Someone else already moved or released it.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let taken = fs::read_to_string(&tombstone).ok();
        if taken.is_some() && taken.as_deref() == seen {
            fs::remove_file(&tombstone)?;
            return Ok(true);
        }

        // A new holder replaced the stale file between our read and rename.
        // hard_link never overwrites, so a third writer is not clobbered.
        if let Err(e) = fs::hard_link(&tombstone, path) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                warn!(
                    path = %path.display(),
                    tombstone = %tombstone.display(),
                    error = %e,
                    "Failed to restore lock taken over during reclaim"
                );
                return Err(e.into());
            }
        }
        let _ = fs::remove_file(&tombstone);
        debug!(path = %path.display(), "Lock changed hands during reclaim, backing off");
        Ok(false)
    }

    /// Whether the holder described by `record` should be treated as gone.
    pub fn is_stale(&self, record: &LockRecord) -> bool {
        let age = record.age();
        match self.liveness {
            LockLiveness::Timeout => age > self.stale_after,
            LockLiveness::Process => {
                if record.hostname != local_hostname() {
                    return age > self.stale_after;
                }
                match process_alive(record.pid) {
                    Some(true) => false,
                    Some(false) => age > self.grace,
                    None => age > self.stale_after,
                }
            }
        }
    }

    /// Unparsable lock file: either mid-write or left by a crash.
    fn unreadable_is_stale(&self, path: &Path) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age > self.grace)
            .unwrap_or(false)
    }

    /// Take the lock for `workflow`, reclaiming it if the current holder is stale.
    pub fn acquire_lock(&self, workflow: &str, run_id: &RunId) -> Result<LockGuard> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            WeaveError::State(format!(
                "failed to create lock directory '{}': {}",
                self.dir.display(),
                e
            ))
        })?;

        let path = self.lock_path(workflow);
        let record = LockRecord::new(workflow, run_id);

        // One reclaim at most; losing the race after that is contention.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let json = serde_json::to_string_pretty(&record)?;
                    let written = file
                        .write_all(json.as_bytes())
                        .and_then(|_| file.sync_all());
                    if let Err(e) = written {
                        let _ = fs::remove_file(&path);
                        return Err(WeaveError::State(format!(
                            "failed to write lock '{}': {}",
                            path.display(),
                            e
                        )));
                    }
                    debug!(workflow = %workflow, run_id = %run_id, "Lock acquired");
                    return Ok(LockGuard {
                        path,
                        run_id: run_id.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let seen = fs::read_to_string(&path).ok();
                    let holder: Option<LockRecord> =
                        seen.as_deref().and_then(|c| serde_json::from_str(c).ok());
                    let stale = match &holder {
                        Some(h) => self.is_stale(h),
                        None => self.unreadable_is_stale(&path),
                    };
                    if !stale {
                        return Err(WeaveError::LockContention {
                            workflow: workflow.to_string(),
                            holder_run: holder
                                .map(|h| h.run_id.to_string())
                                .unwrap_or_else(|| "unknown".into()),
                        });
                    }
                    match &holder {
                        Some(h) => warn!(
                            workflow = %workflow,
                            holder_run = %h.run_id,
                            holder_pid = h.pid,
                            holder_host = %h.hostname,
                            age_secs = h.age().as_secs(),
                            "Reclaiming stale lock"
                        ),
                        None => warn!(
                            workflow = %workflow,
                            path = %path.display(),
                            "Reclaiming unreadable stale lock"
                        ),
                    }
                    if !self.reclaim(&path, seen.as_deref(), run_id)? {
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let holder = Self::read_record(&path)
            .map(|h| h.run_id.to_string())
            .unwrap_or_else(|| "unknown".into());
        Err(WeaveError::LockContention {
            workflow: workflow.to_string(),
            holder_run: holder,
        })
    }

    /// Release the lock if `run_id` still holds it. Idempotent; returns
    /// whether a file was removed.
    pub fn release_lock(&self, workflow: &str, run_id: &RunId) -> Result<bool> {
        release_path(&self.lock_path(workflow), run_id)
    }

    pub fn inspect(&self, workflow: &str) -> Result<Option<LockInfo>> {
        let path = self.lock_path(workflow);
        if !path.exists() {
            return Ok(None);
        }
        let record = Self::read_record(&path).ok_or_else(|| {
            WeaveError::State(format!("unreadable lock file '{}'", path.display()))
        })?;
        let stale = self.is_stale(&record);
        Ok(Some(LockInfo {
            path,
            record,
            stale,
        }))
    }

    /// Remove the lock regardless of holder.
    pub fn force_release(&self, workflow: &str) -> Result<bool> {
        let path = self.lock_path(workflow);
        match fs::remove_file(&path) {
            Ok(()) => {
                warn!(workflow = %workflow, "Lock force-released");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn release_path(path: &Path, run_id: &RunId) -> Result<bool> {
    match LockManager::read_record(path) {
        Some(record) if &record.run_id == run_id => match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        },
        Some(record) => {
            // Reclaimed by someone else after we went stale.
            warn!(
                path = %path.display(),
                holder_run = %record.run_id,
                run_id = %run_id,
                "Lock now held by another run, leaving it"
            );
            Ok(false)
        }
        None => Ok(false),
    }
}

/// RAII handle for a held lock; releases on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    run_id: RunId,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        release_path(&self.path, &self.run_id)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = release_path(&self.path, &self.run_id) {
                warn!(path = %self.path.display(), error = %e, "Failed to release lock");
            }
        }
    }
}
