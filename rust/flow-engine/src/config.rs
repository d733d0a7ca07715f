//! Engine configuration and persisted state layout.
//!
//! Configuration loads from defaults, an optional `.env` file, and
//! `FLOW_`-prefixed environment variables (e.g. `FLOW_DURABLE=true`,
//! `FLOW_STATE_ROOT=/var/lib/flows`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Main engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root directory for all persisted state (`flows.db`, worker records,
    /// dispatch notices).
    pub state_root: PathBuf,
    /// Repository root handed to spawned workers.
    pub repo_root: PathBuf,
    /// When true, every store write is flushed with `synchronous = FULL`.
    /// Trades latency for a stronger crash guarantee.
    pub durable: bool,
    /// Event stream poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Grace window between SIGTERM and SIGKILL when stopping a worker.
    pub stop_grace_ms: u64,
    /// Worker process argv. The engine appends
    /// `--repo-root <path> --run-id <id>` when spawning. Empty means
    /// out-of-process launch is unavailable (embedded mode only).
    pub worker_command: Vec<String>,
    /// Number of trailing stderr bytes captured into crash reports.
    pub stderr_tail_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_root: PathBuf::from("./state"),
            repo_root: PathBuf::from("."),
            durable: false,
            poll_interval_ms: 250,
            stop_grace_ms: 5000,
            worker_command: Vec::new(),
            stderr_tail_bytes: 4096,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables and defaults.
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("state_root", "./state")?
            .set_default("repo_root", ".")?
            .set_default("durable", false)?
            .set_default("poll_interval_ms", 250)?
            .set_default("stop_grace_ms", 5000)?
            .set_default("worker_command", Vec::<String>::new())?
            .set_default("stderr_tail_bytes", 4096)?
            .add_source(
                config::Environment::with_prefix("FLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Derived state layout for this configuration.
    #[must_use]
    pub fn paths(&self) -> StatePaths {
        StatePaths::new(&self.state_root)
    }

    /// Poll interval as a [`std::time::Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    /// Stop grace window as a [`std::time::Duration`].
    #[must_use]
    pub fn stop_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.stop_grace_ms)
    }
}

/// Resolved locations of everything the engine persists under a state root.
///
/// The worker record and crash report live *outside* the transactional
/// store so they stay readable even when `flows.db` itself is corrupt.
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    /// Create a layout rooted at `root`.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// State root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The SQLite run store (`flows.db`).
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.root.join("flows.db")
    }

    /// Per-run directory for worker-side files.
    #[must_use]
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("flows").join(run_id)
    }

    /// Worker record (`flows/<run_id>/worker.json`).
    #[must_use]
    pub fn worker_record_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("worker.json")
    }

    /// Crash report (`flows/<run_id>/crash.json`).
    #[must_use]
    pub fn crash_report_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("crash.json")
    }

    /// Captured worker stderr (`flows/<run_id>/worker.stderr.log`).
    #[must_use]
    pub fn stderr_log_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("worker.stderr.log")
    }

    /// Dispatch notice directory (`runs/<run_id>/dispatch_history`).
    #[must_use]
    pub fn dispatch_history_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id).join("dispatch_history")
    }

    /// Corruption notice written next to a rotated store
    /// (`flows.db.corrupt.json`).
    #[must_use]
    pub fn corruption_notice_path(&self) -> PathBuf {
        self.root.join("flows.db.corrupt.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(!config.durable);
        assert_eq!(config.poll_interval_ms, 250);
        assert!(config.worker_command.is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides() {
        std::env::set_var("FLOW_STATE_ROOT", "/var/lib/flows");
        std::env::set_var("FLOW_DURABLE", "true");
        std::env::set_var("FLOW_POLL_INTERVAL_MS", "50");

        let config = EngineConfig::load().unwrap();
        assert_eq!(config.state_root, PathBuf::from("/var/lib/flows"));
        assert!(config.durable);
        assert_eq!(config.poll_interval_ms, 50);

        std::env::remove_var("FLOW_STATE_ROOT");
        std::env::remove_var("FLOW_DURABLE");
        std::env::remove_var("FLOW_POLL_INTERVAL_MS");
    }

    #[test]
    fn test_state_paths_layout() {
        let paths = StatePaths::new("/tmp/state");
        assert_eq!(paths.db_path(), PathBuf::from("/tmp/state/flows.db"));
        assert_eq!(
            paths.worker_record_path("run-1"),
            PathBuf::from("/tmp/state/flows/run-1/worker.json")
        );
        assert_eq!(
            paths.crash_report_path("run-1"),
            PathBuf::from("/tmp/state/flows/run-1/crash.json")
        );
        assert_eq!(
            paths.dispatch_history_dir("run-1"),
            PathBuf::from("/tmp/state/runs/run-1/dispatch_history")
        );
    }
}
