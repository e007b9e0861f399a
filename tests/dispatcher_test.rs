//! Plugin dispatch: env contract, working directory, gating behavior.

use std::time::Duration;

use tempfile::TempDir;
use weftd::config::PluginEntry;
use weftd::dispatch::{PluginDispatcher, PluginStatus};
use weftd::error::WeftError;
use weftd::events::Event;

fn blocking_plugin(name: &str, on: &str, script: &str) -> PluginEntry {
    PluginEntry {
        name: name.to_string(),
        on: vec![on.to_string()],
        run: vec!["sh".into(), "-c".into(), script.into()],
        blocking: true,
        timeout: 10,
        enabled: true,
    }
}

#[tokio::test]
async fn plugin_receives_event_context_as_env() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("env.out");
    let script = format!(
        "echo \"$WEFT_EVENT $WEFT_TASK_ID $WEFT_BRANCH $WEFT_MERGE_COMMIT\" > {}",
        out.display()
    );
    let dispatcher = PluginDispatcher::new(
        vec![blocking_plugin("capture", "branch.merged", &script)],
        tmp.path().to_path_buf(),
    );

    let event = Event::branch_merged("t-1", "weft/t-1", "abc123", &["src/lib.rs".to_string()]);
    dispatcher.emit(&event).await.unwrap();

    let captured = std::fs::read_to_string(&out).unwrap();
    assert_eq!(captured.trim(), "branch.merged t-1 weft/t-1 abc123");
}

#[tokio::test]
async fn plugin_runs_in_worktree_when_it_exists() {
    let tmp = TempDir::new().unwrap();
    let worktree = tmp.path().join("wt");
    std::fs::create_dir_all(&worktree).unwrap();
    let out = tmp.path().join("cwd.out");
    let script = format!("pwd > {}", out.display());
    let dispatcher = PluginDispatcher::new(
        vec![blocking_plugin("cwd", "agent.finished", &script)],
        tmp.path().to_path_buf(),
    );

    let event = Event::agent_finished("t-1", &worktree, 0);
    dispatcher.emit(&event).await.unwrap();
    let cwd = std::fs::read_to_string(&out).unwrap();
    assert!(
        cwd.trim().ends_with("wt"),
        "plugin should run in the worktree, ran in {cwd}"
    );
}

#[tokio::test]
async fn plugin_falls_back_to_main_repo_for_missing_worktree() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("cwd.out");
    let script = format!("pwd > {}", out.display());
    let dispatcher = PluginDispatcher::new(
        vec![blocking_plugin("cwd", "health.zombie", &script)],
        tmp.path().to_path_buf(),
    );

    // The event references a worktree that is already gone.
    let event = Event::health_zombie("t-1", None, false)
        .worktree(tmp.path().join("vanished"));
    dispatcher.emit(&event).await.unwrap();
    let cwd = std::fs::read_to_string(&out).unwrap();
    let canonical_tmp = tmp.path().canonicalize().unwrap();
    assert_eq!(
        std::path::Path::new(cwd.trim()).canonicalize().unwrap(),
        canonical_tmp
    );
}

#[tokio::test]
async fn mixed_blocking_and_detached_plugins() {
    let tmp = TempDir::new().unwrap();
    let detached_out = tmp.path().join("detached.out");
    let mut detached = blocking_plugin(
        "notify",
        "task.completed",
        &format!("echo done > {}", detached_out.display()),
    );
    detached.blocking = false;
    let gate = blocking_plugin("gate", "task.completed", "exit 0");

    let dispatcher = PluginDispatcher::new(vec![gate, detached], tmp.path().to_path_buf());
    let outcomes = dispatcher
        .emit(&Event::task_completed("t-1", "merged"))
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].status, PluginStatus::Success);
    assert_eq!(outcomes[1].status, PluginStatus::Detached);

    // The detached plugin completes on its own schedule.
    for _ in 0..50 {
        if detached_out.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("detached plugin never ran");
}

#[tokio::test]
async fn blocking_gate_reports_reserved_exit_code() {
    let tmp = TempDir::new().unwrap();
    let dispatcher = PluginDispatcher::new(
        vec![blocking_plugin("gate", "branch.merged", "exit 3")],
        tmp.path().to_path_buf(),
    );

    let err = dispatcher
        .emit(&Event::branch_merged("t-1", "weft/t-1", "abc", &[]))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 12);
    match err {
        WeftError::PluginFailure { name, code } => {
            assert_eq!(name, "gate");
            assert_eq!(code, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}
