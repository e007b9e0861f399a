//! Integration tests for per-task worktree lifecycle.

use tempfile::TempDir;
use weftd::error::WeftError;
use weftd::worktree::WorktreeController;

fn init_test_repo(dir: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut opts = git2::RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = git2::Repository::init_opts(dir, &opts)?;

    let sig = git2::Signature::now("Test", "test@example.com")?;
    let tree_id = {
        let blob = repo.blob(b"initial")?;
        let mut tb = repo.treebuilder(None)?;
        tb.insert("README", blob, 0o100644)?;
        tb.write()?
    };
    let tree = repo.find_tree(tree_id)?;
    repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])?;
    Ok(())
}

fn controller(tmp: &TempDir) -> WorktreeController {
    let repo_dir = tmp.path().join("repo");
    std::fs::create_dir_all(&repo_dir).unwrap();
    init_test_repo(&repo_dir).expect("init repo");
    WorktreeController::new(repo_dir, tmp.path().join("worktrees"))
}

#[tokio::test]
async fn create_and_list_worktree() {
    let tmp = TempDir::new().unwrap();
    let worktrees = controller(&tmp);

    let info = worktrees.create("task-abc").await.expect("create worktree");
    assert_eq!(info.task_id, "task-abc");
    assert_eq!(info.branch, "weft/task-abc");
    assert!(info.path.exists(), "worktree directory should exist");
    assert!(info.path.join("README").exists(), "checkout should be populated");
    assert!(worktrees.exists("task-abc"));

    let list = worktrees.list().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].task_id, "task-abc");
    assert!(list[0].branch_exists);
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let worktrees = controller(&tmp);

    worktrees.create("task-dup").await.unwrap();
    let err = worktrees.create("task-dup").await.unwrap_err();
    match err {
        WeftError::WorktreeExists { task_id, .. } => assert_eq!(task_id, "task-dup"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn destroy_removes_directory_but_keeps_branch() {
    let tmp = TempDir::new().unwrap();
    let worktrees = controller(&tmp);

    let info = worktrees.create("task-rm").await.unwrap();
    assert!(worktrees.destroy("task-rm").await.unwrap());
    assert!(!info.path.exists());
    assert!(!worktrees.exists("task-rm"));

    // Branch survives destroy so partial work is recoverable.
    let repo = git2::Repository::open(tmp.path().join("repo")).unwrap();
    assert!(repo
        .find_branch("weft/task-rm", git2::BranchType::Local)
        .is_ok());

    // Idempotent.
    assert!(!worktrees.destroy("task-rm").await.unwrap());
}

#[tokio::test]
async fn delete_branch_after_destroy() {
    let tmp = TempDir::new().unwrap();
    let worktrees = controller(&tmp);

    worktrees.create("task-br").await.unwrap();
    worktrees.destroy("task-br").await.unwrap();
    assert!(worktrees.delete_branch("task-br").await.unwrap());
    assert!(!worktrees.delete_branch("task-br").await.unwrap());

    let repo = git2::Repository::open(tmp.path().join("repo")).unwrap();
    assert!(repo
        .find_branch("weft/task-br", git2::BranchType::Local)
        .is_err());
}

#[tokio::test]
async fn recreate_after_destroy_reuses_branch() {
    let tmp = TempDir::new().unwrap();
    let worktrees = controller(&tmp);

    worktrees.create("task-again").await.unwrap();
    worktrees.destroy("task-again").await.unwrap();
    let info = worktrees.create("task-again").await.expect("recreate");
    assert!(info.path.exists());
}

#[tokio::test]
async fn main_repo_resolves_from_inside_a_worktree() {
    let tmp = TempDir::new().unwrap();
    let worktrees = controller(&tmp);
    let repo_dir = tmp.path().join("repo").canonicalize().unwrap();

    // From the main checkout itself.
    assert_eq!(weftd::main_repo_from(&repo_dir).unwrap(), repo_dir);

    // From a linked worktree, resolution follows the common git dir back.
    let info = worktrees.create("task-wt").await.unwrap();
    assert_eq!(
        weftd::main_repo_from(&info.path).unwrap(),
        repo_dir,
        "worktree should resolve to the main checkout"
    );

    // From outside any repository.
    let bare = tmp.path().join("not-a-repo");
    std::fs::create_dir_all(&bare).unwrap();
    assert!(weftd::main_repo_from(&bare).is_err());
}

#[tokio::test]
async fn list_is_empty_without_base_dir() {
    let tmp = TempDir::new().unwrap();
    let worktrees = controller(&tmp);
    assert!(worktrees.list().await.unwrap().is_empty());
}
