//! Operator-facing dispatch notices.
//!
//! When a run pauses or its worker crashes, the engine writes a Markdown
//! notice under `runs/<run_id>/dispatch_history/NNNN/DISPATCH.md` and
//! records a matching artifact row. The numbered directories preserve the
//! order notices were issued; `DISPATCH.md` carries a small front matter
//! block (`mode`, `title`) followed by a human-readable body, so an
//! operator can `cat` the latest notice without any tooling.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::config::StatePaths;
use crate::store::FlowStore;
use crate::worker::CrashReport;

/// Artifact kind recorded for pause notices.
pub const KIND_PAUSE: &str = "pause_dispatch";
/// Artifact kind recorded for crash notices.
pub const KIND_CRASH: &str = "worker_crash";

/// A notice to be written into the dispatch history.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Front matter `mode` field (`pause`, `crash`).
    pub mode: String,
    /// Front matter `title` field.
    pub title: String,
    /// Markdown body.
    pub body: String,
}

impl Dispatch {
    fn render(&self, run_id: &str) -> String {
        format!(
            "---\nmode: {}\ntitle: {}\nrun_id: {}\ncreated_at: {}\n---\n\n{}\n",
            self.mode,
            self.title,
            run_id,
            chrono::Utc::now().to_rfc3339(),
            self.body.trim_end(),
        )
    }
}

/// Write a notice into the next numbered slot and record an artifact row.
///
/// # Errors
///
/// Returns error if the directory cannot be created, the write fails, or
/// the artifact row cannot be inserted.
pub async fn write_dispatch(
    store: &FlowStore,
    paths: &StatePaths,
    run_id: &str,
    kind: &str,
    dispatch: &Dispatch,
) -> Result<PathBuf> {
    let history_dir = paths.dispatch_history_dir(run_id);
    std::fs::create_dir_all(&history_dir)
        .with_context(|| format!("Failed to create {}", history_dir.display()))?;

    let seq = next_dispatch_seq(&history_dir)?;
    let slot = history_dir.join(format!("{seq:04}"));
    std::fs::create_dir_all(&slot)
        .with_context(|| format!("Failed to create {}", slot.display()))?;

    let notice_path = slot.join("DISPATCH.md");
    std::fs::write(&notice_path, dispatch.render(run_id))
        .with_context(|| format!("Failed to write {}", notice_path.display()))?;

    store
        .create_artifact(
            &Uuid::new_v4().to_string(),
            run_id,
            kind,
            &notice_path.to_string_lossy(),
        )
        .await?;

    Ok(notice_path)
}

/// Notice written when a step pauses its run.
///
/// # Errors
///
/// Returns error if the notice cannot be written or recorded.
pub async fn write_pause_notice(
    store: &FlowStore,
    paths: &StatePaths,
    run_id: &str,
    step: &str,
) -> Result<PathBuf> {
    let dispatch = Dispatch {
        mode: "pause".to_string(),
        title: format!("Run paused at step '{step}'"),
        body: format!(
            "Step `{step}` paused run `{run_id}`.\n\n\
             Review the run state, then resume with the run id above.\n\
             Starting a new run of the same flow type will supersede this one."
        ),
    };
    write_dispatch(store, paths, run_id, KIND_PAUSE, &dispatch).await
}

/// Notice written when the reconciler detects a dead worker.
///
/// # Errors
///
/// Returns error if the notice cannot be written or recorded.
pub async fn write_crash_notice(
    store: &FlowStore,
    paths: &StatePaths,
    run_id: &str,
    report: &CrashReport,
) -> Result<PathBuf> {
    let exit = match (report.exit_code, report.signal.as_deref()) {
        (_, Some(signal)) => format!("killed by {signal}"),
        (Some(code), None) => format!("exit code {code}"),
        (None, None) => "exit status unknown".to_string(),
    };

    let mut body = format!(
        "Worker pid {} for run `{run_id}` died without finishing ({exit}).\n\
         The run was left paused; resume it to retry from the last recorded step.\n",
        report.worker_pid
    );
    if !report.stderr_tail.is_empty() {
        body.push_str("\n## Worker stderr (tail)\n\n```\n");
        body.push_str(report.stderr_tail.trim_end());
        body.push_str("\n```\n");
    }

    let dispatch = Dispatch {
        mode: "crash".to_string(),
        title: format!("Worker crashed ({exit})"),
        body,
    };
    write_dispatch(store, paths, run_id, KIND_CRASH, &dispatch).await
}

/// Next free four-digit slot in a history directory.
fn next_dispatch_seq(history_dir: &Path) -> Result<u32> {
    let mut max_seen: Option<u32> = None;
    for entry in std::fs::read_dir(history_dir)
        .with_context(|| format!("Failed to read {}", history_dir.display()))?
    {
        let entry = entry?;
        if let Ok(n) = entry.file_name().to_string_lossy().parse::<u32>() {
            max_seen = Some(max_seen.map_or(n, |m| m.max(n)));
        }
    }
    Ok(max_seen.map_or(1, |m| m + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (FlowStore, StatePaths, TempDir) {
        let dir = TempDir::new().unwrap();
        let paths = StatePaths::new(dir.path());
        let store = FlowStore::new(paths.db_path()).await.unwrap();
        store
            .create_flow_run("run-1", "t", json!({}), None, None, None)
            .await
            .unwrap();
        (store, paths, dir)
    }

    #[tokio::test]
    async fn test_pause_notice_layout() {
        let (store, paths, _dir) = setup().await;

        let path = write_pause_notice(&store, &paths, "run-1", "review")
            .await
            .unwrap();

        assert!(path.ends_with("0001/DISPATCH.md"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("---\nmode: pause\n"));
        assert!(content.contains("title: Run paused at step 'review'"));
        assert!(content.contains("run_id: run-1"));

        let artifacts = store.get_artifacts("run-1").await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].kind, KIND_PAUSE);
        assert_eq!(artifacts[0].path, path.to_string_lossy());
    }

    #[tokio::test]
    async fn test_slots_increment() {
        let (store, paths, _dir) = setup().await;

        let first = write_pause_notice(&store, &paths, "run-1", "a").await.unwrap();
        let second = write_pause_notice(&store, &paths, "run-1", "b").await.unwrap();

        assert!(first.ends_with("0001/DISPATCH.md"));
        assert!(second.ends_with("0002/DISPATCH.md"));
    }

    #[tokio::test]
    async fn test_crash_notice_includes_stderr_tail() {
        let (store, paths, _dir) = setup().await;

        let report = CrashReport {
            worker_pid: 4242,
            exit_code: None,
            signal: Some("SIGKILL".to_string()),
            last_event: None,
            stderr_tail: "thread 'main' panicked".to_string(),
            detected_at: chrono::Utc::now().to_rfc3339(),
        };

        let path = write_crash_notice(&store, &paths, "run-1", &report)
            .await
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("mode: crash"));
        assert!(content.contains("killed by SIGKILL"));
        assert!(content.contains("thread 'main' panicked"));

        let artifacts = store.get_artifacts("run-1").await.unwrap();
        assert_eq!(artifacts[0].kind, KIND_CRASH);
    }

    #[tokio::test]
    async fn test_seq_skips_non_numeric_entries() {
        let (store, paths, _dir) = setup().await;

        let history = paths.dispatch_history_dir("run-1");
        std::fs::create_dir_all(history.join("notes")).unwrap();
        std::fs::create_dir_all(history.join("0007")).unwrap();

        let path = write_pause_notice(&store, &paths, "run-1", "a").await.unwrap();
        assert!(path.ends_with("0008/DISPATCH.md"));
    }
}
