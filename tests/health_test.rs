//! Zombie detection and recovery against a real repository.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use weftd::config::PluginEntry;
use weftd::dispatch::PluginDispatcher;
use weftd::health::HealthMonitor;
use weftd::store::{MemoryTaskStore, Task, TaskStatus, TaskStore};
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

fn stale_task(id: &str, age_secs: i64) -> Task {
    Task {
        id: id.into(),
        title: String::new(),
        status: TaskStatus::InProgress,
        assignee: Some("agent-a".into()),
        claimed_at: Some(Utc::now() - chrono::Duration::seconds(age_secs + 60)),
        heartbeat_at: Some(Utc::now() - chrono::Duration::seconds(age_secs)),
        depends_on: vec![],
    }
}

struct Fixture {
    store: Arc<MemoryTaskStore>,
    worktrees: Arc<WorktreeController>,
    monitor: HealthMonitor,
    zombie_log: std::path::PathBuf,
    _tmp: TempDir,
}

fn fixture(auto_recover: bool) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let repo_dir = tmp.path().join("repo");
    std::fs::create_dir_all(&repo_dir).unwrap();
    init_test_repo(&repo_dir).unwrap();

    let store = Arc::new(MemoryTaskStore::new());
    let worktrees = Arc::new(WorktreeController::new(
        repo_dir,
        tmp.path().join("worktrees"),
    ));

    // A plugin that appends one line per zombie notification.
    let zombie_log = tmp.path().join("zombies.log");
    let plugin = PluginEntry {
        name: "zombie-log".into(),
        on: vec!["health.zombie".into()],
        run: vec![
            "sh".into(),
            "-c".into(),
            format!("echo \"$WEFT_TASK_ID\" >> {}", zombie_log.display()),
        ],
        blocking: true,
        timeout: 10,
        enabled: true,
    };
    let dispatcher = Arc::new(PluginDispatcher::new(vec![plugin], tmp.path().to_path_buf()));

    let monitor = HealthMonitor::new(
        Arc::clone(&store) as Arc<dyn TaskStore>,
        Arc::clone(&worktrees),
        dispatcher,
        Duration::from_secs(300),
        auto_recover,
    );
    Fixture {
        store,
        worktrees,
        monitor,
        zombie_log,
        _tmp: tmp,
    }
}

fn notification_count(fx: &Fixture) -> usize {
    std::fs::read_to_string(&fx.zombie_log)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn zombie_notifies_exactly_once_per_episode() {
    let fx = fixture(false);
    fx.store.insert(stale_task("t-z", 600));

    fx.monitor.check().await.unwrap();
    fx.monitor.check().await.unwrap();
    fx.monitor.check().await.unwrap();
    assert_eq!(notification_count(&fx), 1);

    // A new heartbeat ends the episode; a later stall starts another.
    fx.store.insert(stale_task("t-z", 5));
    fx.monitor.check().await.unwrap();
    fx.store.insert(stale_task("t-z", 900));
    fx.monitor.check().await.unwrap();
    assert_eq!(notification_count(&fx), 2);
}

#[tokio::test]
async fn report_includes_worktree_presence() {
    let fx = fixture(false);
    fx.store.insert(stale_task("t-wt", 600));
    fx.worktrees.create("t-wt").await.unwrap();

    let reports = fx.monitor.check().await.unwrap();
    assert!(reports[0].worktree_exists);
    assert!(reports[0].is_zombie);
}

#[tokio::test]
async fn auto_recovery_releases_claim_and_destroys_worktree() {
    let fx = fixture(true);
    fx.store.insert(stale_task("t-rec", 600));
    fx.worktrees.create("t-rec").await.unwrap();

    fx.monitor.check().await.unwrap();

    let task = fx.store.get("t-rec").await.unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert!(task.assignee.is_none());
    assert!(!fx.worktrees.exists("t-rec"));

    // The branch survives recovery for manual salvage.
    let repo = git2::Repository::open(fx._tmp.path().join("repo")).unwrap();
    assert!(repo
        .find_branch("weft/t-rec", git2::BranchType::Local)
        .is_ok());
}

#[tokio::test]
async fn recovered_task_can_be_reclaimed_and_rebound() {
    let fx = fixture(true);
    fx.store.insert(stale_task("t-re2", 600));
    fx.worktrees.create("t-re2").await.unwrap();
    fx.monitor.check().await.unwrap();

    // A new agent claims it and gets a fresh worktree on the same branch.
    let claims = weftd::claim::ClaimManager::new(
        Arc::clone(&fx.store) as Arc<dyn TaskStore>,
        "agent-b".into(),
    );
    let guard = claims.claim("t-re2").await.unwrap();
    let info = fx.worktrees.create("t-re2").await.unwrap();
    assert!(info.path.exists());
    guard.keep_claimed();
}
