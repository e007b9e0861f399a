//! Atomic task claiming and crash-safe release.
//!
//! A claim is one conditional update against the store: move the task from
//! its claimable status to `in_progress` with our identity and timestamp.
//! The store applies precondition and write atomically, so exactly one of
//! any number of racing claimers wins; losers get [`WeftError::ClaimConflict`]
//! and must pick another task — the conflict is a correct outcome, never
//! retried here.
//!
//! The winner holds a [`ClaimGuard`]. Every exit path releases it: the
//! happy path calls an explicit method, and `Drop` covers panics and early
//! returns with a synchronous best-effort release.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{Result, WeftError};
use crate::store::{TaskStatus, TaskStore, TaskUpdate};

pub struct ClaimManager {
    store: Arc<dyn TaskStore>,
    agent_id: String,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn TaskStore>, agent_id: String) -> Self {
        Self { store, agent_id }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Claim `task_id` for this agent.
    pub async fn claim(&self, task_id: &str) -> Result<ClaimGuard> {
        let task = self.store.get(task_id).await?;
        if !task.status.is_claimable() {
            return Err(WeftError::ClaimConflict {
                task_id: task_id.to_string(),
                holder: task.assignee.unwrap_or_else(|| task.status.to_string()),
            });
        }

        let update = TaskUpdate::status(TaskStatus::InProgress)
            .assignee(Some(self.agent_id.clone()))
            .claimed_at(Some(Utc::now()))
            .heartbeat_at(None);

        if !self
            .store
            .compare_and_swap(task_id, task.status, update)
            .await?
        {
            // Lost the race between read and write. Report who won.
            let holder = self
                .store
                .get(task_id)
                .await
                .ok()
                .and_then(|t| t.assignee)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(WeftError::ClaimConflict {
                task_id: task_id.to_string(),
                holder,
            });
        }

        info!(task_id, agent_id = %self.agent_id, "task claimed");
        Ok(ClaimGuard {
            store: Arc::clone(&self.store),
            task_id: task_id.to_string(),
            armed: true,
        })
    }

    /// Claim the first claimable task from the store's ready queue.
    pub async fn claim_next(&self) -> Result<Option<ClaimGuard>> {
        for task in self.store.list_ready().await? {
            match self.claim(&task.id).await {
                Ok(guard) => return Ok(Some(guard)),
                Err(WeftError::ClaimConflict { task_id, holder }) => {
                    info!(task_id, holder, "task taken, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// Release an in-progress task back to the claimable pool.
///
/// Idempotent: only a task currently `in_progress` is touched. The restored
/// status is `ready` when every dependency is done, `open` otherwise.
pub async fn release_task(store: &dyn TaskStore, task_id: &str) -> Result<bool> {
    let task = match store.get(task_id).await {
        Ok(task) => task,
        Err(WeftError::TaskNotFound(_)) => return Ok(false),
        Err(e) => return Err(e),
    };
    if task.status != TaskStatus::InProgress {
        return Ok(false);
    }

    let mut deps_done = true;
    for dep in &task.depends_on {
        match store.get(dep).await {
            Ok(dep_task) if dep_task.status == TaskStatus::Done => {}
            Ok(_) | Err(WeftError::TaskNotFound(_)) => {
                deps_done = false;
                break;
            }
            Err(e) => return Err(e),
        }
    }
    let restored = if deps_done {
        TaskStatus::Ready
    } else {
        TaskStatus::Open
    };

    let released = store
        .compare_and_swap(
            task_id,
            TaskStatus::InProgress,
            TaskUpdate::status(restored)
                .assignee(None)
                .claimed_at(None)
                .heartbeat_at(None),
        )
        .await?;
    if released {
        info!(task_id, restored = %restored, "claim released");
    }
    Ok(released)
}

/// Scoped claim. While armed, dropping the guard releases the claim.
pub struct ClaimGuard {
    store: Arc<dyn TaskStore>,
    task_id: String,
    armed: bool,
}

impl ClaimGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Explicit release, with error reporting the Drop path cannot give.
    pub async fn release(mut self) -> Result<bool> {
        self.armed = false;
        release_task(self.store.as_ref(), &self.task_id).await
    }

    /// Keep the task `in_progress` past this guard's lifetime. Used when
    /// the agent finished successfully and the finish workflow takes over.
    pub fn keep_claimed(mut self) {
        self.armed = false;
    }
}

// Manual impl: the store handle has no Debug, but callers assert on
// `Result<ClaimGuard>` values in tests.
impl std::fmt::Debug for ClaimGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimGuard")
            .field("task_id", &self.task_id)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Synchronous path for panics and aborted futures. Errors can only
        // be logged; the health monitor is the backstop if this also fails.
        match self.store.release_blocking(&self.task_id) {
            Ok(true) => info!(task_id = %self.task_id, "claim released on drop"),
            Ok(false) => {}
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "claim release failed on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryTaskStore, Task};

    fn manager(store: &Arc<MemoryTaskStore>, agent: &str) -> ClaimManager {
        ClaimManager::new(
            Arc::clone(store) as Arc<dyn TaskStore>,
            agent.to_string(),
        )
    }

    #[tokio::test]
    async fn claim_sets_ownership_fields() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_ready("t-1");

        let guard = manager(&store, "agent-a").claim("t-1").await.unwrap();
        let task = store.get("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assignee.as_deref(), Some("agent-a"));
        assert!(task.claimed_at.is_some());
        guard.keep_claimed();
    }

    #[tokio::test]
    async fn losing_claimer_gets_conflict_with_holder() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_ready("t-1");

        let _winner = manager(&store, "agent-a").claim("t-1").await.unwrap();
        let err = manager(&store, "agent-b").claim("t-1").await.unwrap_err();
        match err {
            WeftError::ClaimConflict { task_id, holder } => {
                assert_eq!(task_id, "t-1");
                assert_eq!(holder, "agent-a");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn dropping_guard_releases_the_claim() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_ready("t-1");

        {
            let _guard = manager(&store, "agent-a").claim("t-1").await.unwrap();
        }
        let task = store.get("t-1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Open);
        assert!(task.assignee.is_none());
        assert!(task.claimed_at.is_none());
    }

    #[tokio::test]
    async fn release_restores_ready_when_deps_done() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_ready("dep");
        store.mark_done("dep").await.unwrap();
        store.insert(Task {
            id: "t-2".into(),
            title: String::new(),
            status: TaskStatus::Ready,
            assignee: None,
            claimed_at: None,
            heartbeat_at: None,
            depends_on: vec!["dep".into()],
        });

        let guard = manager(&store, "agent-a").claim("t-2").await.unwrap();
        assert!(guard.release().await.unwrap());
        assert_eq!(store.get("t-2").await.unwrap().status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn release_restores_open_when_deps_pending() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_ready("dep");
        store.insert(Task {
            id: "t-3".into(),
            title: String::new(),
            status: TaskStatus::Open,
            assignee: None,
            claimed_at: None,
            heartbeat_at: None,
            depends_on: vec!["dep".into()],
        });

        let guard = manager(&store, "agent-a").claim("t-3").await.unwrap();
        assert!(guard.release().await.unwrap());
        assert_eq!(store.get("t-3").await.unwrap().status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_ready("t-4");
        let guard = manager(&store, "agent-a").claim("t-4").await.unwrap();
        assert!(guard.release().await.unwrap());
        assert!(!release_task(store.as_ref(), "t-4").await.unwrap());
        assert!(!release_task(store.as_ref(), "no-such-task").await.unwrap());
    }

    #[tokio::test]
    async fn claim_next_skips_taken_tasks() {
        let store = Arc::new(MemoryTaskStore::new());
        store.insert_ready("t-a");
        store.insert_ready("t-b");

        let first = manager(&store, "agent-a").claim("t-a").await.unwrap();
        let second = manager(&store, "agent-b")
            .claim_next()
            .await
            .unwrap()
            .expect("a ready task remains");
        assert_eq!(second.task_id(), "t-b");
        first.keep_claimed();
        second.keep_claimed();
    }
}
