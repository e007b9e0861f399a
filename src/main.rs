use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use weftd::agent::AgentRunner;
use weftd::config::Config;
use weftd::daemon::{DaemonControl, DaemonStatus};
use weftd::error::WeftError;
use weftd::events::{Event, EventType};
use weftd::lock::LockStatus;
use weftd::merge::FinishWorkflow;
use weftd::AppContext;

#[derive(Parser)]
#[command(
    name = "weftd",
    about = "Weft — multi-agent worktree coordination",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "WEFT_LOG", default_value = "info", global = true)]
    log: String,
}

#[derive(Subcommand)]
enum Command {
    /// Claim a task and run the agent in its worktree.
    ///
    /// With TASK_ID the named task is claimed; without, the first claimable
    /// ready task is taken. Exits with the agent's exit code, or 10 if the
    /// task was already claimed.
    Run {
        task_id: Option<String>,
    },
    /// Merge a finished task's branch into the integration branch and close
    /// the task. Serialized machine-wide by the merge lock.
    Finish {
        task_id: String,
    },
    /// Abandon a task: release its claim and delete worktree and branch
    /// without merging.
    Abort {
        task_id: String,
    },
    /// Manage the background health daemon.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Inspect or release the merge lock.
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Scan in-progress tasks for zombies and print a report.
    Health,
    /// List per-task worktrees.
    Worktrees,
    /// Emit a lifecycle event to configured plugins, for hook testing.
    ///
    /// Example: weftd emit task.claimed --task-id demo-1
    Emit {
        /// Event name, e.g. `task.claimed`
        event: String,
        #[arg(long)]
        task_id: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Validate or query the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon in the background.
    Start,
    /// Stop the running daemon.
    Stop,
    /// Report whether the daemon is running.
    Status,
    /// Print the last lines of the daemon log.
    Logs {
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    /// Run the daemon in the foreground (used internally by `start`).
    #[command(hide = true)]
    Run,
}

#[derive(Subcommand)]
enum LockAction {
    /// Show the merge lock holder, if any.
    Status,
    /// Remove the merge lock regardless of holder.
    Release {
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Parse the config file and report problems.
    Validate,
    /// Print one value by dotted path, e.g. `daemon.zombie_threshold_secs`.
    Get {
        key: String,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // The foreground daemon logs to a file; everything else to stderr.
    let _log_guard = match &args.command {
        Command::Daemon {
            action: DaemonAction::Run,
        } => setup_file_logging(&args.log),
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log)),
                )
                .compact()
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };

    match dispatch(args.command).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<WeftError>()
                .map(WeftError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

async fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Run { task_id } => {
            let ctx = AppContext::init()?;
            let runner = AgentRunner::new(
                Arc::clone(&ctx.store),
                Arc::clone(&ctx.worktrees),
                Arc::clone(&ctx.dispatcher),
                ctx.claims(),
                ctx.config.agent.command.clone(),
                Duration::from_secs(ctx.config.agent.heartbeat_interval_secs),
            )?;
            let exit = runner.run(task_id.as_deref()).await?;
            Ok(exit)
        }
        Command::Finish { task_id } => {
            let ctx = AppContext::init()?;
            let workflow = finish_workflow(&ctx);
            let outcome = workflow.finish(&task_id).await?;
            if outcome.already_merged {
                println!("{}: already merged ({})", task_id, outcome.merge_commit);
            } else {
                println!(
                    "{}: merged {} into {} ({}, {} files)",
                    task_id,
                    outcome.branch,
                    ctx.config.merge.integration_branch,
                    &outcome.merge_commit[..12.min(outcome.merge_commit.len())],
                    outcome.files_changed.len()
                );
            }
            Ok(0)
        }
        Command::Abort { task_id } => {
            let ctx = AppContext::init()?;
            finish_workflow(&ctx).abort(&task_id).await?;
            println!("{task_id}: aborted");
            Ok(0)
        }
        Command::Daemon { action } => run_daemon_action(action).await,
        Command::Lock { action } => {
            let ctx = AppContext::init()?;
            let lock = ctx.merge_lock();
            match action {
                LockAction::Status => {
                    match lock.status() {
                        LockStatus::Free => println!("merge lock: free"),
                        LockStatus::Held(meta) => {
                            println!(
                                "merge lock: held by task {} (agent {}, pid {}, expires {})",
                                meta.holder,
                                meta.agent,
                                meta.pid,
                                meta.expires_at().to_rfc3339()
                            );
                        }
                        LockStatus::Corrupt => println!("merge lock: corrupt lock file"),
                    }
                    Ok(0)
                }
                LockAction::Release { force } => {
                    if !force {
                        anyhow::bail!("refusing to release without --force");
                    }
                    if lock.force_release()? {
                        println!("merge lock released");
                    } else {
                        println!("merge lock was not held");
                    }
                    Ok(0)
                }
            }
        }
        Command::Health => {
            let ctx = AppContext::init()?;
            let monitor = weftd::health::HealthMonitor::new(
                Arc::clone(&ctx.store),
                Arc::clone(&ctx.worktrees),
                Arc::clone(&ctx.dispatcher),
                Duration::from_secs(ctx.config.daemon.zombie_threshold_secs),
                false,
            );
            let reports = monitor.check().await?;
            if reports.is_empty() {
                println!("no tasks in progress");
            }
            for report in reports {
                let age = report
                    .heartbeat_age_secs
                    .map(|s| format!("{s}s ago"))
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}\tassignee={}\theartbeat={}\tworktree={}\t{}",
                    report.task_id,
                    report.assignee.as_deref().unwrap_or("-"),
                    age,
                    if report.worktree_exists { "yes" } else { "no" },
                    if report.is_zombie { "ZOMBIE" } else { "ok" }
                );
            }
            Ok(0)
        }
        Command::Worktrees => {
            let ctx = AppContext::init()?;
            let infos = ctx.worktrees.list().await?;
            if infos.is_empty() {
                println!("no worktrees");
                return Ok(0);
            }
            // Join in liveness data so stale sessions stand out in the list.
            let in_progress = ctx.store.list_in_progress().await.unwrap_or_default();
            let threshold =
                chrono::Duration::seconds(ctx.config.daemon.zombie_threshold_secs as i64);
            let now = chrono::Utc::now();
            for info in infos {
                let task = in_progress.iter().find(|t| t.id == info.task_id);
                let liveness = match task.and_then(|t| t.liveness_basis()) {
                    Some(basis) => {
                        let age = (now - basis).num_seconds().max(0);
                        if now - basis > threshold {
                            format!("heartbeat {age}s ago (ZOMBIE)")
                        } else {
                            format!("heartbeat {age}s ago")
                        }
                    }
                    None => "no active claim".to_string(),
                };
                println!(
                    "{}\t{}\t{}\t{}{}",
                    info.task_id,
                    info.branch,
                    info.path.display(),
                    liveness,
                    if info.branch_exists { "" } else { "\t(branch missing)" }
                );
            }
            Ok(0)
        }
        Command::Emit {
            event,
            task_id,
            branch,
        } => {
            let ctx = AppContext::init()?;
            let event_type = EventType::parse(&event)
                .ok_or_else(|| anyhow::anyhow!("unknown event '{event}'"))?;
            let mut ev = Event::new(event_type).main_repo(&ctx.main_repo);
            if let Some(id) = task_id {
                ev = ev.task(id);
            }
            if let Some(branch) = branch {
                ev = ev.branch(branch);
            }
            let outcomes = ctx.dispatcher.emit(&ev).await?;
            for outcome in outcomes {
                println!("{}: {:?}", outcome.plugin, outcome.status);
            }
            Ok(0)
        }
        Command::Config { action } => {
            let main_repo = weftd::find_main_repo()?;
            match action {
                ConfigAction::Validate => match Config::discover(&main_repo) {
                    Some(path) => {
                        Config::load(&path)?;
                        println!("{}: ok", path.display());
                        Ok(0)
                    }
                    None => {
                        println!("no config file found, defaults in effect");
                        Ok(0)
                    }
                },
                ConfigAction::Get { key } => {
                    let config = Config::load_or_default(&main_repo)?;
                    match config.get_value(&key) {
                        Some(value) => {
                            println!("{value}");
                            Ok(0)
                        }
                        None => anyhow::bail!("no such key: {key}"),
                    }
                }
            }
        }
    }
}

async fn run_daemon_action(action: DaemonAction) -> Result<i32> {
    let ctx = AppContext::init()?;
    let control = DaemonControl::new(ctx.weft_dir.clone());
    match action {
        DaemonAction::Start => {
            let pid = control.start()?;
            println!("daemon started (pid {pid})");
            Ok(0)
        }
        DaemonAction::Stop => {
            if control.stop()? {
                println!("daemon stopped");
            } else {
                println!("daemon was not running");
            }
            Ok(0)
        }
        DaemonAction::Status => match control.status() {
            DaemonStatus::Running(pid) => {
                println!("daemon running (pid {pid})");
                Ok(0)
            }
            DaemonStatus::Stopped => {
                println!("daemon not running");
                Ok(1)
            }
        },
        DaemonAction::Logs { lines } => {
            let tail = control.tail_logs(lines)?;
            if !tail.is_empty() {
                println!("{tail}");
            }
            Ok(0)
        }
        DaemonAction::Run => {
            control
                .run(
                    &ctx.config,
                    Arc::clone(&ctx.store),
                    Arc::clone(&ctx.worktrees),
                    Arc::clone(&ctx.dispatcher),
                )
                .await?;
            Ok(0)
        }
    }
}

fn finish_workflow(ctx: &AppContext) -> FinishWorkflow {
    FinishWorkflow::new(
        Arc::clone(&ctx.store),
        Arc::clone(&ctx.worktrees),
        Arc::clone(&ctx.dispatcher),
        ctx.merge_lock(),
        ctx.main_repo.clone(),
        ctx.config.merge.integration_branch.clone(),
        ctx.agent_id.clone(),
    )
}

/// File logging for the foreground daemon. The returned guard must stay
/// alive for the process lifetime.
fn setup_file_logging(log_level: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let log_dir = match weftd::find_main_repo() {
        Ok(repo) => repo.join(weftd::config::WEFT_DIR),
        Err(_) => PathBuf::from("."),
    };
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e}, logging to stderr",
            log_dir.display()
        );
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .compact()
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::never(&log_dir, weftd::daemon::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();
    Some(guard)
}
