//! Task store seam.
//!
//! The engine never owns task data; it drives an external tracker through
//! the [`TaskStore`] trait. `compare_and_swap` is the one primitive the
//! claim protocol needs: apply an update only if the task is still in the
//! expected status, report whether it took effect.

pub mod cli;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use cli::CliTaskStore;
pub use memory::MemoryTaskStore;

/// Task states the coordination engine cares about. The tracker may keep
/// richer states; anything unknown maps to `Blocked` and is never touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Ready,
    Blocked,
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::Open | TaskStatus::Ready)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::Ready => "ready",
            TaskStatus::Blocked => "blocked",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The engine's view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Task {
    /// The timestamp zombie detection measures staleness from: the last
    /// heartbeat, or the claim time if the agent never heartbeat at all.
    pub fn liveness_basis(&self) -> Option<DateTime<Utc>> {
        self.heartbeat_at.or(self.claimed_at)
    }
}

/// Field changes for a conditional update. `None` leaves the field alone;
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub assignee: Option<Option<String>>,
    pub claimed_at: Option<Option<DateTime<Utc>>>,
    pub heartbeat_at: Option<Option<DateTime<Utc>>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn assignee(mut self, assignee: Option<String>) -> Self {
        self.assignee = Some(assignee);
        self
    }

    pub fn claimed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.claimed_at = Some(at);
        self
    }

    pub fn heartbeat_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.heartbeat_at = Some(at);
        self
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(assignee) = &self.assignee {
            task.assignee = assignee.clone();
        }
        if let Some(claimed_at) = self.claimed_at {
            task.claimed_at = claimed_at;
        }
        if let Some(heartbeat_at) = self.heartbeat_at {
            task.heartbeat_at = heartbeat_at;
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, task_id: &str) -> Result<Task>;

    async fn list_in_progress(&self) -> Result<Vec<Task>>;

    /// Tasks that are claimable right now (status open/ready with all
    /// dependencies done), in the tracker's priority order.
    async fn list_ready(&self) -> Result<Vec<Task>>;

    /// Apply `update` only if the task is currently in `expect`. Returns
    /// `Ok(true)` if the update was applied, `Ok(false)` if the precondition
    /// failed because someone else got there first.
    async fn compare_and_swap(
        &self,
        task_id: &str,
        expect: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool>;

    /// Record a heartbeat for `task_id` if it is still in progress and held
    /// by `agent_id`. Heartbeats never move backwards. Returns whether the
    /// write landed.
    async fn record_heartbeat(&self, task_id: &str, agent_id: &str) -> Result<bool>;

    async fn mark_done(&self, task_id: &str) -> Result<()>;

    /// Synchronous best-effort release used from `Drop` when a guard is
    /// torn down outside an async context. Must be idempotent; errors are
    /// swallowed by the caller.
    fn release_blocking(&self, task_id: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_applies_only_set_fields() {
        let mut task = Task {
            id: "t-1".into(),
            title: "demo".into(),
            status: TaskStatus::Ready,
            assignee: Some("agent-a".into()),
            claimed_at: Some(Utc::now()),
            heartbeat_at: None,
            depends_on: vec![],
        };

        TaskUpdate::status(TaskStatus::InProgress).apply(&mut task);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assignee.as_deref(), Some("agent-a"));

        TaskUpdate::default()
            .assignee(None)
            .claimed_at(None)
            .apply(&mut task);
        assert!(task.assignee.is_none());
        assert!(task.claimed_at.is_none());
        assert_eq!(task.status, TaskStatus::InProgress);
    }

    #[test]
    fn liveness_basis_prefers_heartbeat() {
        let claimed = Utc::now() - chrono::Duration::seconds(600);
        let beat = Utc::now() - chrono::Duration::seconds(10);
        let mut task = Task {
            id: "t-2".into(),
            title: String::new(),
            status: TaskStatus::InProgress,
            assignee: None,
            claimed_at: Some(claimed),
            heartbeat_at: None,
            depends_on: vec![],
        };
        assert_eq!(task.liveness_basis(), Some(claimed));
        task.heartbeat_at = Some(beat);
        assert_eq!(task.liveness_basis(), Some(beat));
    }

    #[test]
    fn status_parsing_round_trips() {
        for status in [
            TaskStatus::Open,
            TaskStatus::Ready,
            TaskStatus::Blocked,
            TaskStatus::InProgress,
            TaskStatus::Done,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let back: TaskStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(back, status);
        }
    }
}
