//! Lifecycle event types and their environment-variable contract.
//!
//! Every state transition in the engine emits one of a closed set of events.
//! Plugins receive the event context as `WEFT_*` environment variables —
//! the payload is data, the configured command is code, and the boundary
//! between the two is this module.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

/// Prefix for all context variables handed to plugin processes.
pub const ENV_PREFIX: &str = "WEFT_";

/// The closed set of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    AgentSpawned,
    AgentFinished,
    BranchMerged,
    TaskClaimed,
    TaskCompleted,
    HealthZombie,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::AgentSpawned,
        EventType::AgentFinished,
        EventType::BranchMerged,
        EventType::TaskClaimed,
        EventType::TaskCompleted,
        EventType::HealthZombie,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventType::AgentSpawned => "agent.spawned",
            EventType::AgentFinished => "agent.finished",
            EventType::BranchMerged => "branch.merged",
            EventType::TaskClaimed => "task.claimed",
            EventType::TaskCompleted => "task.completed",
            EventType::HealthZombie => "health.zombie",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        EventType::ALL.into_iter().find(|e| e.name() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single event instance with its typed context fields.
///
/// `extra` keeps insertion order so plugins see context variables in a
/// stable, documented order.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub task_id: Option<String>,
    pub branch: Option<String>,
    pub worktree: Option<PathBuf>,
    pub main_repo: Option<PathBuf>,
    pub extra: Vec<(String, String)>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            task_id: None,
            branch: None,
            worktree: None,
            main_repo: None,
            extra: Vec::new(),
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn worktree(mut self, path: impl Into<PathBuf>) -> Self {
        self.worktree = Some(path.into());
        self
    }

    pub fn main_repo(mut self, path: impl Into<PathBuf>) -> Self {
        self.main_repo = Some(path.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    // ── Typed constructors guaranteeing the required fields per event ──────

    pub fn agent_spawned(task_id: &str, worktree: &std::path::Path, agent_pid: u32) -> Self {
        Event::new(EventType::AgentSpawned)
            .task(task_id)
            .worktree(worktree)
            .extra("agent_pid", agent_pid.to_string())
    }

    pub fn agent_finished(task_id: &str, worktree: &std::path::Path, exit_code: i32) -> Self {
        Event::new(EventType::AgentFinished)
            .task(task_id)
            .worktree(worktree)
            .extra("exit_code", exit_code.to_string())
    }

    pub fn branch_merged(
        task_id: &str,
        branch: &str,
        merge_commit: &str,
        files_changed: &[String],
    ) -> Self {
        Event::new(EventType::BranchMerged)
            .task(task_id)
            .branch(branch)
            .extra("merge_commit", merge_commit)
            .extra("files_changed", files_changed.join(","))
    }

    pub fn task_claimed(task_id: &str, assignee: &str) -> Self {
        Event::new(EventType::TaskClaimed)
            .task(task_id)
            .extra("assignee", assignee)
    }

    pub fn task_completed(task_id: &str, resolution: &str) -> Self {
        Event::new(EventType::TaskCompleted)
            .task(task_id)
            .extra("resolution", resolution)
    }

    pub fn health_zombie(
        task_id: &str,
        last_heartbeat: Option<DateTime<Utc>>,
        worktree_exists: bool,
    ) -> Self {
        Event::new(EventType::HealthZombie)
            .task(task_id)
            .extra(
                "last_heartbeat",
                last_heartbeat
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string()),
            )
            .extra("worktree_exists", worktree_exists.to_string())
    }

    /// The environment-variable contract handed to plugin processes.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (format!("{ENV_PREFIX}EVENT"), self.event_type.name().to_string()),
            (format!("{ENV_PREFIX}TIMESTAMP"), self.timestamp.to_rfc3339()),
        ];
        if let Some(id) = &self.task_id {
            env.push((format!("{ENV_PREFIX}TASK_ID"), id.clone()));
        }
        if let Some(branch) = &self.branch {
            env.push((format!("{ENV_PREFIX}BRANCH"), branch.clone()));
        }
        if let Some(worktree) = &self.worktree {
            env.push((format!("{ENV_PREFIX}WORKTREE"), worktree.display().to_string()));
        }
        if let Some(repo) = &self.main_repo {
            env.push((format!("{ENV_PREFIX}MAIN_REPO"), repo.display().to_string()));
        }
        for (key, value) in &self.extra {
            env.push((format!("{ENV_PREFIX}{}", key.to_uppercase()), value.clone()));
        }
        env
    }
}
