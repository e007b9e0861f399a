//! Finish workflow: merge the task branch and close the task.
//!
//! The whole sequence — merge, `branch.merged` gating, mark done — runs
//! under the merge lock so concurrent finishes serialize on the
//! integration branch. A blocking plugin that rejects `branch.merged`
//! rolls the integration branch back to its pre-merge commit; the merge is
//! only durable once the gate passes.
//!
//! Cleanup (worktree and branch removal) is tolerant: the merge is already
//! committed and the task closed, so cleanup failures are logged and the
//! workflow still reports success.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::claim::release_task;
use crate::dispatch::PluginDispatcher;
use crate::error::{Result, WeftError};
use crate::events::Event;
use crate::lock::MergeLock;
use crate::store::{TaskStatus, TaskStore};
use crate::worktree::WorktreeController;

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub task_id: String,
    pub branch: String,
    pub merge_commit: String,
    pub files_changed: Vec<String>,
    /// True when the integration branch already contained the work.
    pub already_merged: bool,
}

struct MergeCommit {
    oid: git2::Oid,
    previous_tip: git2::Oid,
    files_changed: Vec<String>,
    already_merged: bool,
}

pub struct FinishWorkflow {
    store: Arc<dyn TaskStore>,
    worktrees: Arc<WorktreeController>,
    dispatcher: Arc<PluginDispatcher>,
    lock: MergeLock,
    repo_path: PathBuf,
    integration_branch: String,
    agent_id: String,
}

impl FinishWorkflow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        worktrees: Arc<WorktreeController>,
        dispatcher: Arc<PluginDispatcher>,
        lock: MergeLock,
        repo_path: PathBuf,
        integration_branch: String,
        agent_id: String,
    ) -> Self {
        Self {
            store,
            worktrees,
            dispatcher,
            lock,
            repo_path,
            integration_branch,
            agent_id,
        }
    }

    /// Merge `task_id`'s branch into the integration branch and close the
    /// task.
    pub async fn finish(&self, task_id: &str) -> Result<MergeOutcome> {
        let task = self.store.get(task_id).await?;
        if task.status != TaskStatus::InProgress {
            return Err(WeftError::MergeFailed(format!(
                "task {task_id} is {} (finish requires in_progress)",
                task.status
            )));
        }
        if !self.worktrees.exists(task_id) {
            return Err(WeftError::WorktreeMissing(task_id.to_string()));
        }

        let branch = WorktreeController::branch_for(task_id);
        let lock_guard = self.lock.acquire(task_id, &self.agent_id).await?;

        let merged = {
            let repo_path = self.repo_path.clone();
            let branch_name = branch.clone();
            let integration = self.integration_branch.clone();
            tokio::task::spawn_blocking(move || {
                merge_branch_blocking(&repo_path, &branch_name, &integration)
            })
            .await
            .map_err(|e| WeftError::MergeFailed(format!("merge task panicked: {e}")))??
        };

        info!(
            task_id,
            branch = %branch,
            merge_commit = %merged.oid,
            files = merged.files_changed.len(),
            already_merged = merged.already_merged,
            "branch merged"
        );

        let event = Event::branch_merged(
            task_id,
            &branch,
            &merged.oid.to_string(),
            &merged.files_changed,
        )
        .main_repo(&self.repo_path);
        if let Err(gate) = self.dispatcher.emit(&event).await {
            if !merged.already_merged {
                warn!(task_id, error = %gate, "branch.merged rejected, rolling back");
                self.rollback(merged.previous_tip).await?;
            }
            drop(lock_guard);
            return Err(gate);
        }

        self.store.mark_done(task_id).await?;
        self.dispatcher
            .emit(&Event::task_completed(task_id, "merged"))
            .await?;

        if let Err(e) = self.worktrees.destroy(task_id).await {
            warn!(task_id, error = %e, "worktree cleanup failed");
        }
        if let Err(e) = self.worktrees.delete_branch(task_id).await {
            warn!(task_id, error = %e, "branch cleanup failed");
        }

        if let Err(e) = lock_guard.release() {
            warn!(task_id, error = %e, "merge lock release failed");
        }

        Ok(MergeOutcome {
            task_id: task_id.to_string(),
            branch,
            merge_commit: merged.oid.to_string(),
            files_changed: merged.files_changed,
            already_merged: merged.already_merged,
        })
    }

    /// Abandon a task: release its claim and remove worktree and branch
    /// without merging anything.
    pub async fn abort(&self, task_id: &str) -> Result<()> {
        let released = release_task(self.store.as_ref(), task_id).await?;
        let destroyed = self.worktrees.destroy(task_id).await?;
        let branch_deleted = self.worktrees.delete_branch(task_id).await?;
        info!(task_id, released, destroyed, branch_deleted, "task aborted");
        self.dispatcher
            .emit(&Event::task_completed(task_id, "aborted"))
            .await?;
        Ok(())
    }

    async fn rollback(&self, previous_tip: git2::Oid) -> Result<()> {
        let repo_path = self.repo_path.clone();
        let integration = self.integration_branch.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let repo = git2::Repository::open(&repo_path)?;
            let mut reference = repo.find_reference(&format!("refs/heads/{integration}"))?;
            reference.set_target(previous_tip, "weftd: merge gate rejected")?;
            refresh_workdir_if_checked_out(&repo, &integration)?;
            Ok(())
        })
        .await
        .map_err(|e| WeftError::MergeFailed(format!("rollback task panicked: {e}")))?
    }
}

// ── Blocking git2 merge ──────────────────────────────────────────────────────

fn merge_branch_blocking(
    repo_path: &Path,
    branch_name: &str,
    integration: &str,
) -> Result<MergeCommit> {
    let repo = git2::Repository::open(repo_path)?;

    let integration_ref = format!("refs/heads/{integration}");
    let integration_commit = repo
        .find_reference(&integration_ref)
        .map_err(|_| WeftError::MergeFailed(format!("integration branch '{integration}' not found")))?
        .peel_to_commit()?;
    let branch_commit = repo
        .find_branch(branch_name, git2::BranchType::Local)
        .map_err(|_| WeftError::MergeFailed(format!("branch '{branch_name}' not found")))?
        .get()
        .peel_to_commit()?;

    // Nothing to do when the integration branch already contains the work.
    if repo.graph_descendant_of(integration_commit.id(), branch_commit.id())?
        || integration_commit.id() == branch_commit.id()
    {
        return Ok(MergeCommit {
            oid: integration_commit.id(),
            previous_tip: integration_commit.id(),
            files_changed: vec![],
            already_merged: true,
        });
    }

    let mut index = repo.merge_commits(&integration_commit, &branch_commit, None)?;
    if index.has_conflicts() {
        let mut paths: Vec<String> = index
            .conflicts()?
            .filter_map(|c| c.ok())
            .filter_map(|c| c.our.or(c.their))
            .map(|entry| String::from_utf8_lossy(&entry.path).to_string())
            .collect();
        paths.sort();
        paths.dedup();
        return Err(WeftError::MergeFailed(format!(
            "merge conflicts in: {}",
            paths.join(", ")
        )));
    }

    let tree_oid = index.write_tree_to(&repo)?;
    let tree = repo.find_tree(tree_oid)?;
    let signature = repo
        .signature()
        .or_else(|_| git2::Signature::now("weftd", "weftd@localhost"))?;
    let message = format!("Merge {branch_name} into {integration}");
    // Always a merge commit with both parents, even for fast-forwardable
    // branches, so every task leaves a merge boundary in history.
    let merge_oid = repo.commit(
        Some(&integration_ref),
        &signature,
        &signature,
        &message,
        &tree,
        &[&integration_commit, &branch_commit],
    )?;

    let mut files_changed = Vec::new();
    let diff = repo.diff_tree_to_tree(Some(&integration_commit.tree()?), Some(&tree), None)?;
    for delta in diff.deltas() {
        if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
            files_changed.push(path.to_string_lossy().to_string());
        }
    }
    files_changed.sort();
    files_changed.dedup();

    refresh_workdir_if_checked_out(&repo, integration)?;

    Ok(MergeCommit {
        oid: merge_oid,
        previous_tip: integration_commit.id(),
        files_changed,
        already_merged: false,
    })
}

/// After moving the integration ref, sync the main checkout's workdir if
/// that branch is what's checked out there.
fn refresh_workdir_if_checked_out(repo: &git2::Repository, integration: &str) -> Result<()> {
    if let Ok(head) = repo.head() {
        if head.shorthand() == Some(integration) {
            let mut opts = git2::build::CheckoutBuilder::new();
            opts.force();
            repo.checkout_head(Some(&mut opts))?;
        }
    }
    Ok(())
}
