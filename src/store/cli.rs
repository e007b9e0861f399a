//! Task store backed by an external tracker command.
//!
//! Wire protocol (JSON over argv, one subprocess per call):
//!
//! ```text
//! <cmd> show <id> --json
//! <cmd> list --status in_progress --json
//! <cmd> ready --json
//! <cmd> update <id> --if-status <s> [--if-assignee A]
//!       [--status <s>] [--assignee A | --clear-assignee]
//!       [--claimed-at TS | --clear-claimed-at] [--heartbeat-at TS | --clear-heartbeat]
//! <cmd> close <id>
//! ```
//!
//! `update` exits 0 when applied and 3 when any `--if-*` precondition
//! failed; precondition checks and write are atomic on the tracker side,
//! which is what makes claims and heartbeats race-free across processes.
//! `close` moves the task to done and clears assignee, claimed-at and
//! heartbeat on the tracker side.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::{Result, WeftError};

use super::{Task, TaskStatus, TaskStore, TaskUpdate};

/// Tracker exit code meaning "precondition failed, nothing changed".
const EXIT_PRECONDITION_FAILED: i32 = 3;

pub struct CliTaskStore {
    command: Vec<String>,
    call_timeout: Duration,
}

impl CliTaskStore {
    pub fn new(command: Vec<String>, call_timeout: Duration) -> Result<Self> {
        if command.is_empty() {
            return Err(WeftError::Config("store command is empty".into()));
        }
        Ok(Self {
            command,
            call_timeout,
        })
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = tokio::process::Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(store_cmd = %self.command[0], store_args = ?args, "store call");

        let child = cmd
            .spawn()
            .map_err(|e| WeftError::StoreUnavailable(format!("cannot spawn {}: {e}", self.command[0])))?;

        match tokio::time::timeout(self.call_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(WeftError::StoreUnavailable(format!("store call failed: {e}"))),
            Err(_) => Err(WeftError::StoreUnavailable(format!(
                "store call timed out after {}s",
                self.call_timeout.as_secs()
            ))),
        }
    }

    async fn run_json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WeftError::StoreUnavailable(format!(
                "store exited {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| WeftError::StoreUnavailable(format!("malformed store output: {e}")))
    }

    /// `update` with the conditional exit-code contract.
    async fn run_conditional(&self, args: &[&str]) -> Result<bool> {
        let output = self.run(args).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(EXIT_PRECONDITION_FAILED) => Ok(false),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(WeftError::StoreUnavailable(format!(
                    "store update exited {}: {}",
                    code.unwrap_or(-1),
                    stderr.trim()
                )))
            }
        }
    }
}

fn push_update_args(args: &mut Vec<String>, update: &TaskUpdate) {
    if let Some(status) = update.status {
        args.push("--status".into());
        args.push(status.as_str().into());
    }
    match &update.assignee {
        Some(Some(assignee)) => {
            args.push("--assignee".into());
            args.push(assignee.clone());
        }
        Some(None) => args.push("--clear-assignee".into()),
        None => {}
    }
    match update.claimed_at {
        Some(Some(at)) => {
            args.push("--claimed-at".into());
            args.push(at.to_rfc3339());
        }
        Some(None) => args.push("--clear-claimed-at".into()),
        None => {}
    }
    match update.heartbeat_at {
        Some(Some(at)) => {
            args.push("--heartbeat-at".into());
            args.push(at.to_rfc3339());
        }
        Some(None) => args.push("--clear-heartbeat".into()),
        None => {}
    }
}

#[async_trait]
impl TaskStore for CliTaskStore {
    async fn get(&self, task_id: &str) -> Result<Task> {
        match self.run_json::<Task>(&["show", task_id, "--json"]).await {
            Ok(task) => Ok(task),
            Err(WeftError::StoreUnavailable(msg)) if msg.contains("not found") => {
                Err(WeftError::TaskNotFound(task_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn list_in_progress(&self) -> Result<Vec<Task>> {
        self.run_json(&["list", "--status", "in_progress", "--json"])
            .await
    }

    async fn list_ready(&self) -> Result<Vec<Task>> {
        self.run_json(&["ready", "--json"]).await
    }

    async fn compare_and_swap(
        &self,
        task_id: &str,
        expect: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool> {
        let mut args: Vec<String> = vec![
            "update".into(),
            task_id.into(),
            "--if-status".into(),
            expect.as_str().into(),
        ];
        push_update_args(&mut args, &update);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_conditional(&arg_refs).await
    }

    async fn record_heartbeat(&self, task_id: &str, agent_id: &str) -> Result<bool> {
        let task = self.get(task_id).await?;
        if task.status != TaskStatus::InProgress || task.assignee.as_deref() != Some(agent_id) {
            return Ok(false);
        }
        let now = Utc::now();
        // Clock skew between writers must never move the heartbeat backwards.
        if task.heartbeat_at.is_some_and(|prev| prev >= now) {
            return Ok(true);
        }
        // Both preconditions ride on the write: the read above is only a
        // fast path, and the claim may be stolen between it and the update.
        let at = now.to_rfc3339();
        self.run_conditional(&[
            "update",
            task_id,
            "--if-status",
            TaskStatus::InProgress.as_str(),
            "--if-assignee",
            agent_id,
            "--heartbeat-at",
            &at,
        ])
        .await
    }

    async fn mark_done(&self, task_id: &str) -> Result<()> {
        let output = self.run(&["close", task_id]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WeftError::StoreUnavailable(format!(
                "store close exited {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn release_blocking(&self, task_id: &str) -> Result<bool> {
        // Synchronous variant for Drop paths: one std::process call, same
        // conditional-update contract.
        let output = std::process::Command::new(&self.command[0])
            .args(&self.command[1..])
            .args([
                "update",
                task_id,
                "--if-status",
                TaskStatus::InProgress.as_str(),
                "--status",
                TaskStatus::Open.as_str(),
                "--clear-assignee",
                "--clear-claimed-at",
                "--clear-heartbeat",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| WeftError::StoreUnavailable(format!("cannot spawn {}: {e}", self.command[0])))?;

        match output.code() {
            Some(0) => Ok(true),
            Some(EXIT_PRECONDITION_FAILED) => Ok(false),
            code => Err(WeftError::StoreUnavailable(format!(
                "store update exited {}",
                code.unwrap_or(-1)
            ))),
        }
    }
}
