//! In-memory task store for tests and simulations.
//!
//! Uses a std `Mutex` rather than tokio's so `release_blocking` works from
//! `Drop`. No lock is held across an await point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Result, WeftError};

use super::{Task, TaskStatus, TaskStore, TaskUpdate};

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.tasks.lock().unwrap().insert(task.id.clone(), task);
    }

    pub fn insert_ready(&self, task_id: &str) {
        self.insert(Task {
            id: task_id.to_string(),
            title: format!("task {task_id}"),
            status: TaskStatus::Ready,
            assignee: None,
            claimed_at: None,
            heartbeat_at: None,
            depends_on: vec![],
        });
    }

    fn cas_inner(&self, task_id: &str, expect: TaskStatus, update: &TaskUpdate) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| WeftError::TaskNotFound(task_id.to_string()))?;
        if task.status != expect {
            return Ok(false);
        }
        update.apply(task);
        Ok(true)
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, task_id: &str) -> Result<Task> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| WeftError::TaskNotFound(task_id.to_string()))
    }

    async fn list_in_progress(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn list_ready(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        let mut ready: Vec<Task> = tasks
            .values()
            .filter(|t| {
                t.status.is_claimable()
                    && t.depends_on.iter().all(|dep| {
                        tasks
                            .get(dep)
                            .is_some_and(|d| d.status == TaskStatus::Done)
                    })
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(ready)
    }

    async fn compare_and_swap(
        &self,
        task_id: &str,
        expect: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool> {
        self.cas_inner(task_id, expect, &update)
    }

    async fn record_heartbeat(&self, task_id: &str, agent_id: &str) -> Result<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| WeftError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::InProgress || task.assignee.as_deref() != Some(agent_id) {
            return Ok(false);
        }
        let now = Utc::now();
        if task.heartbeat_at.is_none_or(|prev| prev < now) {
            task.heartbeat_at = Some(now);
        }
        Ok(true)
    }

    async fn mark_done(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| WeftError::TaskNotFound(task_id.to_string()))?;
        task.status = TaskStatus::Done;
        // A done task has no owner; only in_progress carries claim fields.
        task.assignee = None;
        task.claimed_at = None;
        task.heartbeat_at = None;
        Ok(())
    }

    fn release_blocking(&self, task_id: &str) -> Result<bool> {
        self.cas_inner(
            task_id,
            TaskStatus::InProgress,
            &TaskUpdate::status(TaskStatus::Open)
                .assignee(None)
                .claimed_at(None)
                .heartbeat_at(None),
        )
    }
}
