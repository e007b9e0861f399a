//! Distributed merge lock over an atomic lock file.
//!
//! Only one merge may touch the integration branch at a time, across every
//! process on the machine. The lock is a single file created with
//! `create_new` — the one filesystem operation that is atomic on every
//! platform we care about — carrying JSON metadata about the holder.
//!
//! A lease timestamp bounds how long a crashed holder can wedge the system:
//! once the lease elapses the lock is breakable (automatically by the next
//! acquirer under `break_stale = "auto"`, or only via `lock release --force`
//! under `"manual"`).

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BreakStale, LockSection};
use crate::error::{Result, WeftError};

pub const LOCK_FILE: &str = "merge.lock";

/// Metadata stamped into the lock file at acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMeta {
    /// Task whose merge holds the lock.
    pub holder: String,
    /// Agent identity, for operator display.
    pub agent: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub lease_secs: u64,
    /// Random token proving ownership; release checks it so a later holder
    /// is never removed by a stale guard.
    pub token: String,
}

impl LockMeta {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + chrono::Duration::seconds(self.lease_secs as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Observed state of the lock file, for `weftd lock status`.
#[derive(Debug)]
pub enum LockStatus {
    Free,
    Held(LockMeta),
    /// The file exists but is unreadable or unparseable. Treated like an
    /// expired lock: breakable under `auto`, force-release otherwise.
    Corrupt,
}

pub struct MergeLock {
    path: PathBuf,
    config: LockSection,
}

impl MergeLock {
    pub fn new(weft_dir: &Path, config: LockSection) -> Self {
        Self {
            path: weft_dir.join(LOCK_FILE),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> LockStatus {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<LockMeta>(&raw) {
                Ok(meta) => LockStatus::Held(meta),
                Err(_) => LockStatus::Corrupt,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LockStatus::Free,
            Err(_) => LockStatus::Corrupt,
        }
    }

    /// Acquire the lock for `task_id`, waiting up to the configured timeout.
    ///
    /// Returns a [`LockGuard`] that releases on drop; prefer the explicit
    /// async [`LockGuard::release`] so failures are observable.
    pub async fn acquire(&self, task_id: &str, agent_id: &str) -> Result<LockGuard> {
        let deadline = Instant::now() + Duration::from_secs(self.config.acquire_timeout_secs);
        let started = Instant::now();
        // Deterministic pseudo-jitter; an LCG is plenty to de-synchronize
        // pollers without pulling in a rand dependency.
        let mut jitter_state: u64 = std::process::id() as u64 ^ 0x9e37_79b9_7f4a_7c15;

        loop {
            if let Some(guard) = self.try_install(task_id, agent_id)? {
                info!(
                    task_id,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "merge lock acquired"
                );
                return Ok(guard);
            }

            // Occupied. Inspect the incumbent for lease expiry. Breaking a
            // stale or corrupt lock made progress, so those paths retry
            // immediately; everything else falls through to the deadline
            // check and the backoff sleep.
            match self.status() {
                LockStatus::Free => {} // released between attempts
                LockStatus::Held(meta) => {
                    if meta.is_expired(Utc::now()) && self.config.break_stale == BreakStale::Auto {
                        warn!(
                            stale_holder = %meta.holder,
                            stale_pid = meta.pid,
                            acquired_at = %meta.acquired_at,
                            "breaking expired merge lock"
                        );
                        self.break_lock(&meta.token)?;
                        continue;
                    }
                    debug!(holder = %meta.holder, "merge lock busy, waiting");
                }
                LockStatus::Corrupt => {
                    if self.config.break_stale == BreakStale::Auto {
                        warn!("removing corrupt merge lock file");
                        self.remove_file()?;
                        continue;
                    }
                }
            }

            if Instant::now() >= deadline {
                let holder = match self.status() {
                    LockStatus::Held(meta) => meta.holder,
                    LockStatus::Corrupt => "<corrupt lock file>".into(),
                    LockStatus::Free => "<contended>".into(),
                };
                return Err(WeftError::LockTimeout {
                    waited_secs: started.elapsed().as_secs(),
                    holder,
                });
            }

            jitter_state = jitter_state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let base_ms = self.config.poll_interval_secs * 1000;
            let jitter_ms = jitter_state % (base_ms / 2).max(1);
            tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
        }
    }

    /// One atomic installation attempt. `Ok(None)` means the lock is held.
    fn try_install(&self, task_id: &str, agent_id: &str) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let meta = LockMeta {
            holder: task_id.to_string(),
            agent: agent_id.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
            lease_secs: self.config.lease_secs,
            token: Uuid::new_v4().to_string(),
        };
        let payload = serde_json::to_string_pretty(&meta)
            .map_err(|e| WeftError::Config(format!("lock metadata: {e}")))?;

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                use std::io::Write;
                file.write_all(payload.as_bytes())?;
                file.sync_all()?;
                Ok(Some(LockGuard {
                    path: self.path.clone(),
                    meta,
                    released: false,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the lock file only if it still carries `token`. Another
    /// process may have broken and re-acquired in between.
    fn break_lock(&self, token: &str) -> Result<()> {
        if let LockStatus::Held(current) = self.status() {
            if current.token == token {
                self.remove_file()?;
            }
        }
        Ok(())
    }

    fn remove_file(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Operator escape hatch: remove the lock regardless of holder.
    pub fn force_release(&self) -> Result<bool> {
        let existed = self.path.exists();
        self.remove_file()?;
        if existed {
            warn!("merge lock force-released");
        }
        Ok(existed)
    }
}

/// Held lock. Releasing checks the token so only our own lock file is ever
/// removed.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    meta: LockMeta,
    released: bool,
}

impl LockGuard {
    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    /// Explicit release. Idempotent with the Drop path.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_by_token(&self.path, &self.meta.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release_by_token(&self.path, &self.meta.token) {
            warn!(holder = %self.meta.holder, error = %e, "merge lock release failed in drop");
        }
    }
}

fn release_by_token(path: &Path, token: &str) -> Result<()> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let ours = serde_json::from_str::<LockMeta>(&raw)
        .map(|meta| meta.token == token)
        .unwrap_or(false);
    if !ours {
        // Lease expired and someone else took over; their lock is theirs.
        return Ok(());
    }
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
