//! Background daemon lifecycle.
//!
//! The daemon is the host for the health monitor. `weftd daemon start`
//! re-executes the current binary as a detached `daemon run` process and
//! records its pid in `.weft/daemon.pid`; `stop` signals it and waits;
//! `status` probes the pid. The pid file is the single source of truth —
//! a stale file (process gone) is treated as not running and overwritten.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::PluginDispatcher;
use crate::error::{Result, WeftError};
use crate::health::HealthMonitor;
use crate::store::TaskStore;
use crate::worktree::WorktreeController;

pub const PID_FILE: &str = "daemon.pid";
pub const LOG_FILE: &str = "daemon.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(u32),
    Stopped,
}

pub struct DaemonControl {
    weft_dir: PathBuf,
}

impl DaemonControl {
    pub fn new(weft_dir: PathBuf) -> Self {
        Self { weft_dir }
    }

    fn pid_path(&self) -> PathBuf {
        self.weft_dir.join(PID_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.weft_dir.join(LOG_FILE)
    }

    pub fn status(&self) -> DaemonStatus {
        match self.read_pid() {
            Some(pid) if process_alive(pid) => DaemonStatus::Running(pid),
            _ => DaemonStatus::Stopped,
        }
    }

    fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.pid_path())
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Spawn a detached `weftd daemon run` and report its pid.
    pub fn start(&self) -> Result<u32> {
        if let DaemonStatus::Running(pid) = self.status() {
            return Err(WeftError::Config(format!(
                "daemon already running (pid {pid})"
            )));
        }
        std::fs::create_dir_all(&self.weft_dir)?;

        let exe = std::env::current_exe()?;
        let mut cmd = std::process::Command::new(exe);
        cmd.args(["daemon", "run"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn()?;
        let pid = child.id();
        info!(pid, "daemon started");
        Ok(pid)
    }

    /// Signal the daemon and wait for it to exit. Escalates to SIGKILL
    /// after ten polls.
    pub fn stop(&self) -> Result<bool> {
        let pid = match self.read_pid() {
            Some(pid) => pid,
            None => return Ok(false),
        };
        if !process_alive(pid) {
            std::fs::remove_file(self.pid_path()).ok();
            return Ok(false);
        }

        terminate(pid, false)?;
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(500));
            if !process_alive(pid) {
                std::fs::remove_file(self.pid_path()).ok();
                info!(pid, "daemon stopped");
                return Ok(true);
            }
        }
        warn!(pid, "daemon ignored SIGTERM, killing");
        terminate(pid, true)?;
        std::fs::remove_file(self.pid_path()).ok();
        Ok(true)
    }

    /// Last `lines` lines of the daemon log.
    pub fn tail_logs(&self, lines: usize) -> Result<String> {
        let raw = match std::fs::read_to_string(self.log_path()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };
        let all: Vec<&str> = raw.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].join("\n"))
    }

    /// The foreground daemon body: own the pid file, run the health loop,
    /// exit cleanly on SIGINT/SIGTERM.
    pub async fn run(
        &self,
        config: &Config,
        store: Arc<dyn TaskStore>,
        worktrees: Arc<WorktreeController>,
        dispatcher: Arc<PluginDispatcher>,
    ) -> Result<()> {
        if let DaemonStatus::Running(pid) = self.status() {
            return Err(WeftError::Config(format!(
                "daemon already running (pid {pid})"
            )));
        }
        std::fs::create_dir_all(&self.weft_dir)?;
        std::fs::write(self.pid_path(), std::process::id().to_string())?;

        let monitor = Arc::new(HealthMonitor::new(
            store,
            worktrees,
            dispatcher,
            Duration::from_secs(config.daemon.zombie_threshold_secs),
            config.daemon.auto_recover,
        ));

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let loop_handle = tokio::spawn(Arc::clone(&monitor).run(
            Duration::from_secs(config.daemon.health_interval_secs),
            shutdown_rx,
        ));

        wait_for_signal().await;
        info!("shutdown signal received");
        shutdown_tx.send(true).ok();
        loop_handle.await.ok();

        std::fs::remove_file(self.pid_path()).ok();
        Ok(())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // kill(pid, 0): permission check only, no signal delivered.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32, force: bool) -> Result<()> {
    let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // ESRCH: already gone, which is what we wanted.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(_pid: u32, _force: bool) -> Result<()> {
    Err(WeftError::Config(
        "daemon control is only supported on unix".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_pid_file_reads_as_stopped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let control = DaemonControl::new(tmp.path().to_path_buf());
        assert_eq!(control.status(), DaemonStatus::Stopped);

        // A pid that cannot exist on Linux (max is < 2^22 by default).
        std::fs::write(tmp.path().join(PID_FILE), "99999999").unwrap();
        assert_eq!(control.status(), DaemonStatus::Stopped);
    }

    #[test]
    fn own_pid_reads_as_running() {
        let tmp = tempfile::TempDir::new().unwrap();
        let control = DaemonControl::new(tmp.path().to_path_buf());
        std::fs::write(tmp.path().join(PID_FILE), std::process::id().to_string()).unwrap();
        assert_eq!(control.status(), DaemonStatus::Running(std::process::id()));
    }

    #[test]
    fn tail_returns_last_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let control = DaemonControl::new(tmp.path().to_path_buf());
        assert_eq!(control.tail_logs(5).unwrap(), "");

        std::fs::write(control.log_path(), "a\nb\nc\nd\n").unwrap();
        assert_eq!(control.tail_logs(2).unwrap(), "c\nd");
        assert_eq!(control.tail_logs(10).unwrap(), "a\nb\nc\nd");
    }
}
