//! Zombie detection and recovery.
//!
//! An in-progress task whose agent stopped heartbeating is a zombie: its
//! claim blocks other agents while nobody works on it. The monitor scans
//! the store on an interval, measures staleness from the last heartbeat
//! (falling back to the claim time for agents that died before their first
//! beat), and emits `health.zombie` once per episode.
//!
//! Episode bookkeeping is keyed on the liveness timestamp itself: a new
//! heartbeat starts a new episode, so a task that recovers and goes stale
//! again is flagged again, while an unchanged zombie is not re-announced
//! every pass. Every pass re-evaluates from live data; nothing is cached
//! between scans except the already-notified marker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::claim::release_task;
use crate::dispatch::PluginDispatcher;
use crate::error::Result;
use crate::events::Event;
use crate::store::{TaskStatus, TaskStore};
use crate::worktree::WorktreeController;

/// One scanned task, for `weftd health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub task_id: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    /// Seconds since the last heartbeat (or claim). `None` when the task
    /// carries neither timestamp.
    pub heartbeat_age_secs: Option<u64>,
    pub worktree_exists: bool,
    pub is_zombie: bool,
    /// True the first time this staleness episode is seen.
    pub newly_flagged: bool,
}

pub struct HealthMonitor {
    store: Arc<dyn TaskStore>,
    worktrees: Arc<WorktreeController>,
    dispatcher: Arc<PluginDispatcher>,
    zombie_threshold: chrono::Duration,
    auto_recover: bool,
    /// task_id -> liveness basis of the episode already notified.
    notified: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        worktrees: Arc<WorktreeController>,
        dispatcher: Arc<PluginDispatcher>,
        zombie_threshold: Duration,
        auto_recover: bool,
    ) -> Self {
        Self {
            store,
            worktrees,
            dispatcher,
            zombie_threshold: chrono::Duration::from_std(zombie_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            auto_recover,
            notified: Mutex::new(HashMap::new()),
        }
    }

    /// One scan pass over every in-progress task.
    pub async fn check(&self) -> Result<Vec<HealthReport>> {
        let tasks = self.store.list_in_progress().await?;
        let now = Utc::now();
        let mut reports = Vec::with_capacity(tasks.len());
        let scanned: std::collections::HashSet<String> =
            tasks.iter().map(|t| t.id.clone()).collect();

        for task in tasks {
            let basis = task.liveness_basis();
            let age = basis.map(|b| (now - b).num_seconds().max(0) as u64);
            // No claim timestamp at all: claimed out-of-band. Treat as a
            // zombie immediately, with the epoch as its episode key.
            let is_zombie = match basis {
                Some(b) => now - b > self.zombie_threshold,
                None => true,
            };
            let episode_key = basis.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            let worktree_exists = self.worktrees.exists(&task.id);

            let newly_flagged = if is_zombie {
                let mut notified = self.notified.lock().unwrap();
                match notified.get(&task.id) {
                    Some(seen) if *seen == episode_key => false,
                    _ => {
                        notified.insert(task.id.clone(), episode_key);
                        true
                    }
                }
            } else {
                // Heartbeat resumed; forget the episode so a later stall
                // is announced again.
                self.notified.lock().unwrap().remove(&task.id);
                false
            };

            if newly_flagged {
                warn!(
                    task_id = %task.id,
                    assignee = task.assignee.as_deref().unwrap_or(""),
                    heartbeat_age_secs = age.unwrap_or(0),
                    worktree_exists,
                    "zombie task detected"
                );
                let event = Event::health_zombie(&task.id, basis, worktree_exists);
                if let Err(e) = self.dispatcher.emit(&event).await {
                    // A failing plugin must not stop the scan.
                    warn!(task_id = %task.id, error = %e, "health.zombie dispatch failed");
                }
                if self.auto_recover {
                    if let Err(e) = self.recover(&task.id).await {
                        error!(task_id = %task.id, error = %e, "zombie auto-recovery failed");
                    }
                }
            }

            reports.push(HealthReport {
                task_id: task.id,
                status: task.status,
                assignee: task.assignee,
                heartbeat_age_secs: age,
                worktree_exists,
                is_zombie,
                newly_flagged,
            });
        }

        // Tasks that left in_progress (finished, aborted, recovered by
        // another process) take their episode markers with them. Without
        // this the map grows for the daemon's whole lifetime, and a task id
        // reused after completion would inherit a stale marker.
        self.notified
            .lock()
            .unwrap()
            .retain(|id, _| scanned.contains(id));

        Ok(reports)
    }

    /// Release the zombie's claim and destroy its worktree. The branch is
    /// kept so partial work stays recoverable. Idempotent.
    pub async fn recover(&self, task_id: &str) -> Result<bool> {
        let released = release_task(self.store.as_ref(), task_id).await?;
        let destroyed = self.worktrees.destroy(task_id).await?;
        if released || destroyed {
            info!(task_id, released, destroyed, "zombie recovered");
        }
        self.notified.lock().unwrap().remove(task_id);
        Ok(released || destroyed)
    }

    /// Scan loop. Stops when `shutdown` flips to true.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.check().await {
                        Ok(reports) => {
                            let zombies = reports.iter().filter(|r| r.is_zombie).count();
                            debug!(scanned = reports.len(), zombies, "health scan complete");
                        }
                        Err(e) => warn!(error = %e, "health scan failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor stopping");
                        return;
                    }
                }
            }
        }
    }
}
