//! weftd — multi-agent worktree coordination.
//!
//! Coordinates a fleet of coding agents working one git repository:
//! atomic task claiming against an external tracker, per-task worktrees,
//! a machine-wide merge lock on the integration branch, zombie detection
//! for crashed agents, and event-driven plugin hooks.

pub mod agent;
pub mod claim;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod lock;
pub mod merge;
pub mod store;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::claim::ClaimManager;
use crate::config::Config;
use crate::dispatch::PluginDispatcher;
use crate::error::{Result, WeftError};
use crate::store::{CliTaskStore, TaskStore};
use crate::worktree::WorktreeController;

/// Everything a command needs, wired once at startup.
pub struct AppContext {
    pub config: Config,
    pub main_repo: PathBuf,
    pub weft_dir: PathBuf,
    pub store: Arc<dyn TaskStore>,
    pub worktrees: Arc<WorktreeController>,
    pub dispatcher: Arc<PluginDispatcher>,
    pub agent_id: String,
}

impl AppContext {
    pub fn init() -> Result<Self> {
        let main_repo = find_main_repo()?;
        let config = Config::load_or_default(&main_repo)?;
        Self::with_config(config, main_repo)
    }

    pub fn with_config(config: Config, main_repo: PathBuf) -> Result<Self> {
        let weft_dir = main_repo.join(config::WEFT_DIR);
        let store: Arc<dyn TaskStore> = Arc::new(CliTaskStore::new(
            config.store.command.clone(),
            Duration::from_secs(config.store.call_timeout_secs),
        )?);
        let worktrees = Arc::new(WorktreeController::new(
            main_repo.clone(),
            config.worktree_base(&main_repo),
        ));
        let dispatcher = Arc::new(PluginDispatcher::new(
            config.plugins.clone(),
            main_repo.clone(),
        ));
        Ok(Self {
            config,
            main_repo,
            weft_dir,
            store,
            worktrees,
            dispatcher,
            agent_id: agent::agent_identity(),
        })
    }

    pub fn claims(&self) -> ClaimManager {
        ClaimManager::new(Arc::clone(&self.store), self.agent_id.clone())
    }

    pub fn merge_lock(&self) -> lock::MergeLock {
        lock::MergeLock::new(&self.weft_dir, self.config.lock.clone())
    }
}

/// Resolve the main checkout from the current directory: discover the
/// enclosing repository and, when run from inside a linked worktree,
/// follow the common git dir back to the primary one.
pub fn find_main_repo() -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    main_repo_from(&cwd)
}

/// [`find_main_repo`] for an explicit start directory.
pub fn main_repo_from(start: &Path) -> Result<PathBuf> {
    let repo = git2::Repository::discover(start).map_err(|_| {
        WeftError::Config(format!("not inside a git repository: {}", start.display()))
    })?;
    let git_dir = if repo.is_worktree() {
        // A linked worktree's git dir carries a `commondir` file pointing
        // back at the primary `.git` directory (usually relative).
        let raw = std::fs::read_to_string(repo.path().join("commondir"))?;
        let common = PathBuf::from(raw.trim());
        if common.is_absolute() {
            common
        } else {
            repo.path().join(common)
        }
    } else {
        repo.path().to_path_buf()
    };
    let git_dir = git_dir.canonicalize().unwrap_or(git_dir);
    // The primary git dir is `<main>/.git`; its parent is the checkout.
    git_dir
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| WeftError::Config("cannot resolve main repository root".into()))
}
