//! Event-driven plugin dispatch.
//!
//! Plugins are external commands configured as ordered `[[plugins]]`
//! entries. Blocking plugins run sequentially in configuration order and
//! gate the workflow that emitted the event: a non-zero exit or a timeout
//! aborts it. Non-blocking plugins are spawned fire-and-forget and can
//! never stall or fail a workflow.
//!
//! Event context crosses the boundary only as `WEFT_*` environment
//! variables ([`Event::to_env`]); plugin commands are never given event
//! data as arguments, so config stays static and payloads stay data.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PluginEntry;
use crate::error::{Result, WeftError};
use crate::events::Event;

/// Per-plugin outcome for one emitted event.
#[derive(Debug, Clone)]
pub struct PluginOutcome {
    pub plugin: String,
    pub status: PluginStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    Success,
    Failed(i32),
    TimedOut,
    SpawnError(String),
    /// Non-blocking plugin handed off to a background task.
    Detached,
}

pub struct PluginDispatcher {
    plugins: Vec<PluginEntry>,
    main_repo: PathBuf,
}

impl PluginDispatcher {
    pub fn new(plugins: Vec<PluginEntry>, main_repo: PathBuf) -> Self {
        Self { plugins, main_repo }
    }

    /// Emit `event` to every subscribed, enabled plugin.
    ///
    /// Returns the outcomes when all blocking plugins passed; the first
    /// blocking failure or timeout short-circuits with an error so the
    /// caller's workflow stops. Non-blocking plugins are started before the
    /// error can occur and run to completion regardless.
    pub async fn emit(&self, event: &Event) -> Result<Vec<PluginOutcome>> {
        let matched: Vec<&PluginEntry> = self
            .plugins
            .iter()
            .filter(|p| p.enabled && p.matches(event.event_type))
            .collect();

        debug!(
            event = %event.event_type,
            task_id = event.task_id.as_deref().unwrap_or(""),
            plugins = matched.len(),
            "dispatching event"
        );

        let mut outcomes = Vec::with_capacity(matched.len());
        for plugin in matched {
            if plugin.blocking {
                let status = self.run_blocking(plugin, event).await;
                let outcome = PluginOutcome {
                    plugin: plugin.name.clone(),
                    status: status.clone(),
                };
                outcomes.push(outcome);
                match status {
                    PluginStatus::Success => {}
                    PluginStatus::Failed(code) => {
                        return Err(WeftError::PluginFailure {
                            name: plugin.name.clone(),
                            code,
                        });
                    }
                    PluginStatus::TimedOut => {
                        return Err(WeftError::PluginTimeout {
                            name: plugin.name.clone(),
                            timeout_secs: plugin.timeout,
                        });
                    }
                    PluginStatus::SpawnError(msg) => {
                        // An unspawnable blocking plugin cannot approve the
                        // workflow, so it fails it.
                        warn!(plugin = %plugin.name, error = %msg, "blocking plugin failed to spawn");
                        return Err(WeftError::PluginFailure {
                            name: plugin.name.clone(),
                            code: -1,
                        });
                    }
                    PluginStatus::Detached => unreachable!("blocking plugin cannot detach"),
                }
            } else {
                self.spawn_detached(plugin, event);
                outcomes.push(PluginOutcome {
                    plugin: plugin.name.clone(),
                    status: PluginStatus::Detached,
                });
            }
        }
        Ok(outcomes)
    }

    /// Working directory for plugin processes: the event's worktree when it
    /// still exists, otherwise the main checkout.
    fn cwd_for(&self, event: &Event) -> PathBuf {
        match &event.worktree {
            Some(wt) if wt.is_dir() => wt.clone(),
            _ => self.main_repo.clone(),
        }
    }

    fn command_for(&self, plugin: &PluginEntry, event: &Event) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&plugin.run[0]);
        cmd.args(&plugin.run[1..])
            .envs(event.to_env())
            .current_dir(self.cwd_for(event))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if event.main_repo.is_none() {
            cmd.env("WEFT_MAIN_REPO", &self.main_repo);
        }
        cmd
    }

    async fn run_blocking(&self, plugin: &PluginEntry, event: &Event) -> PluginStatus {
        let mut cmd = self.command_for(plugin, event);
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return PluginStatus::SpawnError(e.to_string()),
        };

        let timeout = Duration::from_secs(plugin.timeout);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                debug!(plugin = %plugin.name, "blocking plugin passed");
                PluginStatus::Success
            }
            Ok(Ok(status)) => {
                let code = status.code().unwrap_or(-1);
                warn!(plugin = %plugin.name, code, "blocking plugin failed");
                PluginStatus::Failed(code)
            }
            Ok(Err(e)) => PluginStatus::SpawnError(e.to_string()),
            Err(_) => {
                warn!(plugin = %plugin.name, timeout_secs = plugin.timeout, "blocking plugin timed out, killing");
                if let Err(e) = child.start_kill() {
                    warn!(plugin = %plugin.name, error = %e, "kill failed");
                }
                let _ = child.wait().await;
                PluginStatus::TimedOut
            }
        }
    }

    fn spawn_detached(&self, plugin: &PluginEntry, event: &Event) {
        let mut cmd = self.command_for(plugin, event);
        let name = plugin.name.clone();
        let event_name = event.event_type.name();
        match cmd.spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) if status.success() => {
                            debug!(plugin = %name, event = event_name, "plugin finished");
                        }
                        Ok(status) => {
                            // Logged only; non-blocking plugins never gate.
                            warn!(
                                plugin = %name,
                                event = event_name,
                                code = status.code().unwrap_or(-1),
                                "plugin exited non-zero"
                            );
                        }
                        Err(e) => warn!(plugin = %name, error = %e, "plugin wait failed"),
                    }
                });
                info!(plugin = %plugin.name, event = event_name, "plugin started");
            }
            Err(e) => {
                warn!(plugin = %plugin.name, error = %e, "plugin failed to spawn");
            }
        }
    }
}
