//! Per-task Git worktree lifecycle.
//!
//! Each claimed task gets an isolated worktree at `{base}/{task_id}/` on a
//! branch `weft/{task_id}` cut from the integration branch HEAD. State is
//! derived from the filesystem and the repository, never cached in memory:
//! several weftd processes (agents, the daemon, operator commands) act on
//! the same repo concurrently and any in-process registry would go stale.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Result, WeftError};

pub const BRANCH_PREFIX: &str = "weft/";

/// Listing entry for `weftd worktrees`.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeInfo {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
    pub branch_exists: bool,
}

pub struct WorktreeController {
    repo_path: PathBuf,
    base_dir: PathBuf,
}

impl WorktreeController {
    pub fn new(repo_path: PathBuf, base_dir: PathBuf) -> Self {
        Self {
            repo_path,
            base_dir,
        }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id)
    }

    pub fn branch_for(task_id: &str) -> String {
        format!("{BRANCH_PREFIX}{task_id}")
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.path_for(task_id).is_dir()
    }

    /// Create the worktree and branch for a task.
    ///
    /// Fails with [`WeftError::WorktreeExists`] when the target directory is
    /// already present — a second agent binding the same task must not
    /// silently share a checkout.
    pub async fn create(&self, task_id: &str) -> Result<WorktreeInfo> {
        let wt_path = self.path_for(task_id);
        if wt_path.exists() {
            return Err(WeftError::WorktreeExists {
                task_id: task_id.to_string(),
                path: wt_path,
            });
        }
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let branch = Self::branch_for(task_id);
        let repo_path = self.repo_path.clone();
        let branch_name = branch.clone();
        let target = wt_path.clone();
        tokio::task::spawn_blocking(move || {
            create_worktree_blocking(&repo_path, &branch_name, &target)
        })
        .await
        .map_err(|e| WeftError::MergeFailed(format!("worktree task panicked: {e}")))??;

        info!(task_id, branch = %branch, path = %wt_path.display(), "worktree created");
        Ok(WorktreeInfo {
            task_id: task_id.to_string(),
            path: wt_path,
            branch,
            branch_exists: true,
        })
    }

    /// Remove a task's worktree, keeping the branch. Idempotent: a missing
    /// worktree returns `Ok(false)`.
    pub async fn destroy(&self, task_id: &str) -> Result<bool> {
        let wt_path = self.path_for(task_id);
        let registered = {
            let repo_path = self.repo_path.clone();
            let target = wt_path.clone();
            tokio::task::spawn_blocking(move || remove_worktree_blocking(&repo_path, &target))
                .await
                .map_err(|e| WeftError::MergeFailed(format!("worktree task panicked: {e}")))?
        };

        match registered {
            Ok(removed) => {
                if removed {
                    debug!(task_id, "worktree removed");
                }
                Ok(removed)
            }
            Err(e) => {
                // git bookkeeping failed; the directory still has to go.
                warn!(task_id, error = %e, "worktree prune failed, removing directory");
                if wt_path.exists() {
                    tokio::fs::remove_dir_all(&wt_path).await?;
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    /// Delete the task branch after a merge (or abort). Idempotent.
    pub async fn delete_branch(&self, task_id: &str) -> Result<bool> {
        let repo_path = self.repo_path.clone();
        let branch = Self::branch_for(task_id);
        tokio::task::spawn_blocking(move || {
            let repo = git2::Repository::open(&repo_path)?;
            let deleted = match repo.find_branch(&branch, git2::BranchType::Local) {
                Ok(mut b) => {
                    b.delete()?;
                    Ok(true)
                }
                Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
                Err(e) => Err(WeftError::Git(e)),
            };
            deleted
        })
        .await
        .map_err(|e| WeftError::MergeFailed(format!("worktree task panicked: {e}")))?
    }

    /// Worktrees currently present on disk, by directory scan.
    pub async fn list(&self) -> Result<Vec<WorktreeInfo>> {
        let mut infos = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(infos),
            Err(e) => return Err(e.into()),
        };

        let repo_path = self.repo_path.clone();
        let branches: std::collections::HashSet<String> =
            tokio::task::spawn_blocking(move || -> Result<_> {
                let repo = git2::Repository::open(&repo_path)?;
                let mut names = std::collections::HashSet::new();
                for branch in repo.branches(Some(git2::BranchType::Local))? {
                    let (branch, _) = branch?;
                    if let Some(name) = branch.name()? {
                        names.insert(name.to_string());
                    }
                }
                Ok(names)
            })
            .await
            .map_err(|e| WeftError::MergeFailed(format!("worktree task panicked: {e}")))??;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let task_id = entry.file_name().to_string_lossy().to_string();
            let branch = Self::branch_for(&task_id);
            infos.push(WorktreeInfo {
                branch_exists: branches.contains(&branch),
                task_id,
                path: entry.path(),
                branch,
            });
        }
        infos.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(infos)
    }
}

// ── Blocking git2 helpers ────────────────────────────────────────────────────

fn create_worktree_blocking(repo_path: &Path, branch_name: &str, wt_path: &Path) -> Result<()> {
    let repo = git2::Repository::open(repo_path)?;
    let head_commit = repo.head()?.peel_to_commit()?;

    // Cut the branch from HEAD, reusing a leftover from an earlier attempt.
    let branch = match repo.branch(branch_name, &head_commit, false) {
        Ok(b) => b,
        Err(e) if e.code() == git2::ErrorCode::Exists => {
            debug!(branch = branch_name, "branch already exists, reusing");
            repo.find_branch(branch_name, git2::BranchType::Local)?
        }
        Err(e) => return Err(e.into()),
    };

    // Worktree names may not contain '/', unlike branch names.
    let wt_name = branch_name.replace('/', "--");
    let mut wt_opts = git2::WorktreeAddOptions::new();
    wt_opts.reference(Some(branch.get()));
    repo.worktree(&wt_name, wt_path, Some(&wt_opts))?;
    Ok(())
}

fn remove_worktree_blocking(repo_path: &Path, wt_path: &Path) -> Result<bool> {
    let repo = git2::Repository::open(repo_path)?;

    for name in repo.worktrees()?.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(name) {
            if wt.path() == wt_path {
                if wt_path.exists() {
                    std::fs::remove_dir_all(wt_path)?;
                }
                wt.prune(Some(
                    git2::WorktreePruneOptions::new().valid(true).working_tree(true),
                ))?;
                return Ok(true);
            }
        }
    }

    // Not registered; clean up a stray directory if one exists.
    if wt_path.exists() {
        std::fs::remove_dir_all(wt_path)?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_embeds_task_id() {
        assert_eq!(WorktreeController::branch_for("proj-a1b"), "weft/proj-a1b");
    }
}
