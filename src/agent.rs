//! Agent session lifecycle: claim, bind worktree, run, report.
//!
//! `weftd run` claims one task, creates its worktree, and runs the
//! configured agent command inside it until it exits. A heartbeat ticker
//! keeps the task's `heartbeat_at` fresh while the agent lives, which is
//! what the health monitor measures liveness by.
//!
//! The claim guard releases on every failure path, including SIGINT and
//! SIGTERM. Only a zero exit leaves the task claimed, handing it to the
//! finish workflow.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::claim::{ClaimGuard, ClaimManager};
use crate::dispatch::PluginDispatcher;
use crate::error::{Result, WeftError};
use crate::events::Event;
use crate::store::TaskStore;
use crate::worktree::WorktreeController;

/// Stable per-process agent identity: `<host>-<pid>-<suffix>`.
pub fn agent_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "agent".to_string());
    let suffix = &Uuid::new_v4().simple().to_string()[..8];
    format!("{host}-{}-{suffix}", std::process::id())
}

pub struct AgentRunner {
    store: Arc<dyn TaskStore>,
    worktrees: Arc<WorktreeController>,
    dispatcher: Arc<PluginDispatcher>,
    claims: ClaimManager,
    command: Vec<String>,
    heartbeat_interval: Duration,
}

impl AgentRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        worktrees: Arc<WorktreeController>,
        dispatcher: Arc<PluginDispatcher>,
        claims: ClaimManager,
        command: Vec<String>,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(WeftError::Config("agent command is empty".into()));
        }
        Ok(Self {
            store,
            worktrees,
            dispatcher,
            claims,
            command,
            heartbeat_interval,
        })
    }

    /// Run one agent session. With `task_id` the named task is claimed;
    /// without, the first claimable ready task is taken. Returns the
    /// agent's exit code.
    pub async fn run(&self, task_id: Option<&str>) -> Result<i32> {
        let guard = match task_id {
            Some(id) => self.claims.claim(id).await?,
            None => match self.claims.claim_next().await? {
                Some(guard) => guard,
                None => {
                    info!("no claimable tasks");
                    return Ok(0);
                }
            },
        };
        let task_id = guard.task_id().to_string();

        // task.claimed fires after the claim is durable. A blocking plugin
        // rejecting it releases the claim via the guard.
        self.dispatcher
            .emit(&Event::task_claimed(&task_id, self.claims.agent_id()))
            .await?;

        let worktree = self.worktrees.create(&task_id).await?;
        self.run_in_worktree(guard, &task_id, &worktree.path, &worktree.branch)
            .await
    }

    async fn run_in_worktree(
        &self,
        guard: ClaimGuard,
        task_id: &str,
        wt_path: &Path,
        branch: &str,
    ) -> Result<i32> {
        let mut child = tokio::process::Command::new(&self.command[0])
            .args(&self.command[1..])
            .current_dir(wt_path)
            .env("WEFT_TASK_ID", task_id)
            .env("WEFT_BRANCH", branch)
            .env("WEFT_WORKTREE", wt_path)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        let pid = child.id().unwrap_or(0);
        info!(task_id, pid, command = %self.command[0], "agent spawned");

        if let Err(e) = self
            .dispatcher
            .emit(&Event::agent_spawned(task_id, wt_path, pid))
            .await
        {
            warn!(task_id, error = %e, "agent.spawned rejected, stopping agent");
            child.start_kill().ok();
            let _ = child.wait().await;
            guard.release().await?;
            return Err(e);
        }

        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.tick().await; // first tick is immediate
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = ticker.tick() => {
                    match self.store.record_heartbeat(task_id, self.claims.agent_id()).await {
                        Ok(true) => {}
                        // Lost the claim (zombie recovery raced us); the
                        // agent has no task to work on anymore.
                        Ok(false) => {
                            warn!(task_id, "claim lost, stopping agent");
                            child.start_kill().ok();
                            let _ = child.wait().await;
                            guard.keep_claimed(); // nothing left to release
                            return Err(WeftError::ClaimConflict {
                                task_id: task_id.to_string(),
                                holder: "unknown".into(),
                            });
                        }
                        Err(e) => warn!(task_id, error = %e, "heartbeat failed"),
                    }
                }
                _ = &mut shutdown => {
                    info!(task_id, "interrupted, stopping agent");
                    child.start_kill().ok();
                    let _ = child.wait().await;
                    guard.release().await?;
                    return Ok(130);
                }
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        info!(task_id, exit_code, "agent finished");

        let finished = Event::agent_finished(task_id, wt_path, exit_code);
        if status.success() {
            self.dispatcher.emit(&finished).await?;
            // Task stays in_progress; `weftd finish` merges and closes it.
            guard.keep_claimed();
        } else {
            if let Err(e) = self.dispatcher.emit(&finished).await {
                warn!(task_id, error = %e, "agent.finished dispatch failed");
            }
            // Failed session: release the claim, keep worktree and branch
            // for inspection. `weftd abort` cleans them up.
            guard.release().await?;
        }
        Ok(exit_code)
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
