//! Configuration — loads `.weft/config.toml`.
//!
//! The file is discovered by walking up from the current directory, so any
//! command run from inside a worktree finds the same configuration as the
//! main checkout. All sections are optional and fall back to defaults.
//!
//! Plugin entries are an ordered array of tables; dispatch order is file
//! order:
//! ```toml
//! [[plugins]]
//! name     = "ci-gate"
//! on       = "branch.merged"
//! run      = ["./scripts/ci-gate.sh"]
//! blocking = true
//! timeout  = 120
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, WeftError};
use crate::events::EventType;

pub const WEFT_DIR: &str = ".weft";
pub const CONFIG_FILE: &str = "config.toml";

const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 60;
const DEFAULT_ZOMBIE_THRESHOLD_SECS: u64 = 300;
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_LOCK_LEASE_SECS: u64 = 600;
const DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_LOCK_POLL_SECS: u64 = 5;
const DEFAULT_PLUGIN_TIMEOUT_SECS: u64 = 30;

fn default_true() -> bool {
    true
}

// ─── DaemonSection ───────────────────────────────────────────────────────────

/// `[daemon]` — health-monitor loop settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Seconds between health scans.
    pub health_interval_secs: u64,
    /// Seconds without a heartbeat before an in-progress task is a zombie.
    pub zombie_threshold_secs: u64,
    /// Release the claim and destroy the worktree of detected zombies.
    pub auto_recover: bool,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            health_interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            zombie_threshold_secs: DEFAULT_ZOMBIE_THRESHOLD_SECS,
            auto_recover: false,
        }
    }
}

// ─── StoreSection ────────────────────────────────────────────────────────────

/// `[store]` — the external task tracker command.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSection {
    /// Tracker invocation as an argument list, e.g. `["bd"]`.
    pub command: Vec<String>,
    /// Per-call timeout; the store is a possibly-slow external process.
    pub call_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            command: vec!["bd".to_string()],
            call_timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
        }
    }
}

// ─── AgentSection ────────────────────────────────────────────────────────────

/// `[agent]` — the worker subprocess spawned per claimed task.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSection {
    /// Agent invocation as an argument list, e.g. `["claude"]`.
    pub command: Vec<String>,
    /// Seconds between heartbeat writes while the agent runs.
    pub heartbeat_interval_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

// ─── WorktreeSection ─────────────────────────────────────────────────────────

/// `[worktree]` — where per-task worktrees live.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WorktreeSection {
    /// Base directory for worktrees. Defaults to a sibling of the main
    /// checkout: `../<repo-name>-worktrees`.
    pub base_dir: Option<PathBuf>,
}

// ─── MergeSection ────────────────────────────────────────────────────────────

/// `[merge]` — integration target.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeSection {
    /// Branch agent work is merged into.
    pub integration_branch: String,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            integration_branch: "main".to_string(),
        }
    }
}

// ─── LockSection ─────────────────────────────────────────────────────────────

/// Policy for breaking a merge lock whose lease has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakStale {
    /// The next acquirer force-breaks an expired lock (default).
    Auto,
    /// Expired locks are reported but only `weftd lock release --force`
    /// removes them.
    Manual,
}

/// `[lock]` — merge-lock lease and acquisition settings.
///
/// The lease must exceed the expected maximum merge duration by a safety
/// margin; expiry exists to recover from a holder crash, not to bound
/// normal operation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockSection {
    pub lease_secs: u64,
    pub acquire_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub break_stale: BreakStale,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            lease_secs: DEFAULT_LOCK_LEASE_SECS,
            acquire_timeout_secs: DEFAULT_LOCK_ACQUIRE_TIMEOUT_SECS,
            poll_interval_secs: DEFAULT_LOCK_POLL_SECS,
            break_stale: BreakStale::Auto,
        }
    }
}

// ─── Plugins ─────────────────────────────────────────────────────────────────

/// One `[[plugins]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginEntry {
    pub name: String,
    /// Event name(s) that trigger this plugin. Accepts a single string or a
    /// list.
    #[serde(deserialize_with = "one_or_many")]
    pub on: Vec<String>,
    /// Command as an argument list — never a shell string.
    pub run: Vec<String>,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default = "default_plugin_timeout")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_plugin_timeout() -> u64 {
    DEFAULT_PLUGIN_TIMEOUT_SECS
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl PluginEntry {
    pub fn matches(&self, event_type: EventType) -> bool {
        self.on.iter().any(|name| name == event_type.name())
    }
}

// ─── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonSection,
    pub store: StoreSection,
    pub agent: AgentSection,
    pub worktree: WorktreeSection,
    pub merge: MergeSection,
    pub lock: LockSection,
    pub plugins: Vec<PluginEntry>,
}

impl Config {
    /// Load from an explicit path.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WeftError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| WeftError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Search `start` and its ancestors for `.weft/config.toml`.
    pub fn discover(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(WEFT_DIR).join(CONFIG_FILE))
            .find(|candidate| candidate.exists())
    }

    /// Load the discovered config, or defaults when none exists.
    pub fn load_or_default(start: &Path) -> Result<Config> {
        match Config::discover(start) {
            Some(path) => Config::load(&path),
            None => Ok(Config::default()),
        }
    }

    /// Reject unknown event names and malformed plugin entries up front so
    /// a typo'd trigger fails at load, not silently at dispatch.
    pub fn validate(&self) -> Result<()> {
        for plugin in &self.plugins {
            if plugin.run.is_empty() {
                return Err(WeftError::Config(format!(
                    "plugin '{}' has an empty run command",
                    plugin.name
                )));
            }
            if plugin.on.is_empty() {
                return Err(WeftError::Config(format!(
                    "plugin '{}' subscribes to no events",
                    plugin.name
                )));
            }
            for event_name in &plugin.on {
                if EventType::parse(event_name).is_none() {
                    let valid: Vec<&str> =
                        EventType::ALL.iter().map(|e| e.name()).collect();
                    return Err(WeftError::Config(format!(
                        "plugin '{}' subscribes to unknown event '{}' (valid: {})",
                        plugin.name,
                        event_name,
                        valid.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }

    /// Enabled plugins matching `event_type`, in configured order.
    pub fn plugins_for(&self, event_type: EventType) -> Vec<&PluginEntry> {
        self.plugins
            .iter()
            .filter(|p| p.enabled && p.matches(event_type))
            .collect()
    }

    /// Resolve the worktree base directory relative to the main checkout.
    pub fn worktree_base(&self, main_repo: &Path) -> PathBuf {
        if let Some(base) = &self.worktree.base_dir {
            if base.is_absolute() {
                return base.clone();
            }
            return main_repo.join(base);
        }
        let repo_name = main_repo
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        main_repo
            .parent()
            .unwrap_or(main_repo)
            .join(format!("{repo_name}-worktrees"))
    }

    /// Look up a value by dot-separated path, e.g. `daemon.zombie_threshold_secs`.
    pub fn get_value(&self, key_path: &str) -> Option<String> {
        let value = toml::Value::try_from(self).ok()?;
        let mut current = &value;
        for part in key_path.split('.') {
            current = match current {
                toml::Value::Table(table) => table.get(part)?,
                toml::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(match current {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.daemon.health_interval_secs, 60);
        assert_eq!(config.daemon.zombie_threshold_secs, 300);
        assert!(!config.daemon.auto_recover);
        assert_eq!(config.lock.lease_secs, 600);
        assert_eq!(config.lock.break_stale, BreakStale::Auto);
        assert_eq!(config.merge.integration_branch, "main");
    }

    #[test]
    fn parses_plugins_in_file_order() {
        let raw = r#"
            [daemon]
            zombie_threshold_secs = 120

            [[plugins]]
            name = "notify"
            on = "agent.finished"
            run = ["notify-send", "agent done"]

            [[plugins]]
            name = "ci-gate"
            on = ["branch.merged", "task.completed"]
            run = ["./ci.sh"]
            blocking = true
            timeout = 120
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.daemon.zombie_threshold_secs, 120);
        assert_eq!(config.plugins.len(), 2);
        assert_eq!(config.plugins[0].name, "notify");
        assert!(!config.plugins[0].blocking);
        assert_eq!(config.plugins[0].timeout, 30);
        assert_eq!(config.plugins[1].on.len(), 2);
        assert!(config.plugins[1].blocking);

        let matched = config.plugins_for(EventType::BranchMerged);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "ci-gate");
    }

    #[test]
    fn disabled_plugins_are_never_selected() {
        let raw = r#"
            [[plugins]]
            name = "off"
            on = "task.claimed"
            run = ["true"]
            enabled = false
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert!(config.plugins_for(EventType::TaskClaimed).is_empty());
    }

    #[test]
    fn unknown_event_name_is_rejected_at_load() {
        let raw = r#"
            [[plugins]]
            name = "typo"
            on = "agent.finishd"
            run = ["true"]
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("agent.finishd"));
        assert!(err.to_string().contains("agent.finished"));
    }

    #[test]
    fn discovers_config_in_ancestor_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let weft = tmp.path().join(WEFT_DIR);
        std::fs::create_dir_all(&weft).unwrap();
        std::fs::write(weft.join(CONFIG_FILE), "[daemon]\nauto_recover = true\n").unwrap();

        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = Config::discover(&nested).expect("config should be discovered");
        assert_eq!(found, weft.join(CONFIG_FILE));

        let config = Config::load_or_default(&nested).unwrap();
        assert!(config.daemon.auto_recover);
    }

    #[test]
    fn dotted_path_lookup() {
        let config = Config::default();
        assert_eq!(
            config.get_value("daemon.health_interval_secs").as_deref(),
            Some("60")
        );
        assert_eq!(config.get_value("store.command.0").as_deref(), Some("bd"));
        assert!(config.get_value("daemon.nope").is_none());
    }
}
