//! Worker process lifecycle: records, liveness, crash reports, termination.
//!
//! Each RUNNING run is driven by one worker process. The engine keeps a
//! small JSON record per run (`worker.json`) with enough identity to tell
//! "that worker is still alive" from "some unrelated process reused the
//! pid". Records and crash reports live outside the transactional store on
//! purpose: they must stay readable even when `flows.db` is corrupt.
//!
//! All JSON files here are written atomically (temp file + rename) so a
//! reader never observes a half-written record.

pub mod runner;

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Identity of the worker process driving a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Run the worker is driving.
    pub run_id: String,
    /// OS process id.
    pub pid: u32,
    /// Argv the worker was spawned with, used to disambiguate pid reuse.
    pub cmd: Vec<String>,
    /// Repository root the worker operates on.
    pub repo_root: String,
    /// RFC 3339 spawn timestamp.
    pub started_at: String,
}

/// Diagnostics persisted when a worker dies without reaching a terminal
/// run status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    /// Pid of the dead worker.
    pub worker_pid: u32,
    /// Exit code, when the engine collected one. Detached workers reaped
    /// by init leave this unset.
    pub exit_code: Option<i32>,
    /// Signal name derived from the exit status (e.g. `SIGKILL`).
    pub signal: Option<String>,
    /// The last event recorded for the run before the crash.
    pub last_event: Option<Value>,
    /// Trailing bytes of the worker's captured stderr.
    pub stderr_tail: String,
    /// RFC 3339 detection timestamp.
    pub detected_at: String,
}

/// Liveness verdict for a recorded worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    /// The recorded pid exists and its command line matches the record.
    Alive,
    /// The recorded pid is gone, or it belongs to a different program.
    Dead,
    /// Liveness could not be determined (e.g. permission denied on the
    /// target process).
    Unknown,
}

/// Write `value` as pretty JSON atomically via a temp file and rename.
///
/// # Errors
///
/// Returns error if the parent directory cannot be created or the write
/// or rename fails.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .context("Record path has no parent directory")?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "record".to_string())
    ));
    let content = serde_json::to_string_pretty(value).context("Failed to serialize record")?;
    std::fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move record into place at {}", path.display()))?;
    Ok(())
}

/// Read a JSON record, returning `None` when the file does not exist.
///
/// # Errors
///
/// Returns error if the file exists but cannot be read or parsed.
pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

impl WorkerRecord {
    /// Persist this record at `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Load a record from `path`, if present.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but is unreadable or malformed.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }
}

impl CrashReport {
    /// Persist this report at `path` atomically.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn write(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Load a report from `path`, if present.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but is unreadable or malformed.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        read_json(path)
    }
}

/// Check whether the recorded worker is still alive.
///
/// `kill(pid, 0)` probes existence; when the pid exists, the process's
/// `/proc/<pid>/cmdline` is compared against the recorded argv so a
/// recycled pid is not mistaken for the worker.
#[must_use]
pub fn check_worker_health(record: &WorkerRecord) -> WorkerHealth {
    #[allow(clippy::cast_possible_wrap, reason = "pids fit in i32 on Linux")]
    let pid = record.pid as i32;

    // SAFETY: kill with signal 0 performs no action, it only checks whether
    // the target process exists and is signalable.
    let probe = unsafe { libc::kill(pid, 0) };
    if probe != 0 {
        let errno = std::io::Error::last_os_error();
        return match errno.raw_os_error() {
            Some(libc::ESRCH) => WorkerHealth::Dead,
            Some(libc::EPERM) => WorkerHealth::Unknown,
            _ => WorkerHealth::Unknown,
        };
    }

    match read_cmdline(record.pid) {
        Some(cmdline) if cmdline_matches(&cmdline, &record.cmd) => WorkerHealth::Alive,
        Some(_) => {
            debug!(pid = record.pid, run_id = %record.run_id, "Pid alive but command line differs, treating worker as dead");
            WorkerHealth::Dead
        }
        // /proc entry vanished between the probe and the read, or not
        // readable. The pid responded to the probe, so don't call it dead.
        None => WorkerHealth::Unknown,
    }
}

fn read_cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    Some(
        raw.split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect(),
    )
}

/// A recorded argv matches when the live command line contains the
/// recorded program and run id. Exact equality is too strict: wrappers
/// and interpreters may prepend arguments.
fn cmdline_matches(live: &[String], recorded: &[String]) -> bool {
    let Some(program) = recorded.first() else {
        return false;
    };
    let program_name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.clone());

    let program_present = live.iter().any(|arg| {
        arg == program
            || Path::new(arg)
                .file_name()
                .is_some_and(|n| n.to_string_lossy() == program_name)
    });

    let rest_present = recorded
        .iter()
        .skip(1)
        .all(|arg| live.iter().any(|l| l == arg));

    program_present && rest_present
}

/// Map a wait-status signal number to its conventional name.
#[must_use]
pub fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "SIGHUP".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGQUIT => "SIGQUIT".to_string(),
        libc::SIGABRT => "SIGABRT".to_string(),
        libc::SIGBUS => "SIGBUS".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGSEGV => "SIGSEGV".to_string(),
        libc::SIGPIPE => "SIGPIPE".to_string(),
        libc::SIGTERM => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}

/// Derive `(exit_code, signal)` from a raw exit code as reported by
/// `ExitStatus::code()` conventions: `None` code with a signal, or a
/// negative code standing in for a signal death.
#[must_use]
pub fn interpret_exit(code: Option<i32>, signal: Option<i32>) -> (Option<i32>, Option<String>) {
    if let Some(sig) = signal {
        return (code, Some(signal_name(sig)));
    }
    match code {
        Some(c) if c < 0 => (Some(c), Some(signal_name(-c))),
        other => (other, None),
    }
}

/// Read the trailing `max_bytes` of a file as lossy UTF-8.
#[must_use]
pub fn read_stderr_tail(path: &Path, max_bytes: usize) -> String {
    let Ok(raw) = std::fs::read(path) else {
        return String::new();
    };
    let start = raw.len().saturating_sub(max_bytes);
    String::from_utf8_lossy(&raw[start..]).into_owned()
}

/// Stop a recorded worker: SIGTERM to its process group, wait up to
/// `grace`, then SIGKILL whatever survived.
///
/// Workers are spawned as their own process group leader, so the group id
/// equals the recorded pid; `killpg` reaches the worker and anything it
/// spawned. When the group signal fails (already reaped, or the worker
/// never became a leader), the single pid is signaled as a fallback.
pub async fn terminate_worker(record: &WorkerRecord, grace: std::time::Duration) {
    #[allow(clippy::cast_possible_wrap, reason = "pids fit in i32 on Linux")]
    let pid = record.pid as i32;

    signal_group(pid, libc::SIGTERM, &record.run_id);

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if check_worker_health(record) == WorkerHealth::Dead {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    warn!(pid = record.pid, run_id = %record.run_id, "Worker survived SIGTERM grace window, escalating to SIGKILL");
    signal_group(pid, libc::SIGKILL, &record.run_id);
}

fn signal_group(pid: i32, signal: i32, run_id: &str) {
    // SAFETY: killpg/kill with a valid signal constant; failure is
    // reported through errno and handled below.
    let group_result = unsafe { libc::killpg(pid, signal) };
    if group_result != 0 {
        let errno = std::io::Error::last_os_error();
        debug!(
            pid,
            run_id,
            error = %errno,
            "Process group signal failed, falling back to single pid"
        );
        // SAFETY: same contract as above.
        unsafe {
            libc::kill(pid, signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record_for(pid: u32, cmd: Vec<&str>) -> WorkerRecord {
        WorkerRecord {
            run_id: "run-1".to_string(),
            pid,
            cmd: cmd.into_iter().map(String::from).collect(),
            repo_root: "/tmp/repo".to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("worker.json");

        let record = record_for(1234, vec!["flow-worker", "--run-id", "run-1"]);
        record.write(&path).unwrap();

        let loaded = WorkerRecord::read(&path).unwrap().unwrap();
        assert_eq!(loaded.pid, 1234);
        assert_eq!(loaded.cmd[0], "flow-worker");

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_missing_record() {
        let dir = TempDir::new().unwrap();
        assert!(WorkerRecord::read(&dir.path().join("worker.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_read_malformed_record_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(WorkerRecord::read(&path).is_err());
    }

    #[test]
    fn test_dead_pid_reported_dead() {
        // Linux pid_max caps at 2^22, so this pid is guaranteed absent.
        let record = record_for(999_999_999, vec!["flow-worker"]);
        assert_eq!(check_worker_health(&record), WorkerHealth::Dead);
    }

    #[test]
    fn test_pid_reuse_detected_via_cmdline() {
        // Our own pid is alive, but its cmdline is the test binary, not
        // "flow-worker-that-does-not-exist".
        let record = record_for(std::process::id(), vec!["flow-worker-that-does-not-exist"]);
        let health = check_worker_health(&record);
        assert!(matches!(health, WorkerHealth::Dead | WorkerHealth::Unknown));
        assert_ne!(health, WorkerHealth::Alive);
    }

    #[test]
    fn test_own_process_reported_alive() {
        let exe = std::env::current_exe().unwrap();
        let record = record_for(
            std::process::id(),
            vec![exe.to_str().unwrap()],
        );
        // cmdline[0] of the test process is the test binary path.
        assert_eq!(check_worker_health(&record), WorkerHealth::Alive);
    }

    #[test]
    fn test_interpret_exit() {
        assert_eq!(interpret_exit(Some(0), None), (Some(0), None));
        assert_eq!(interpret_exit(Some(1), None), (Some(1), None));
        assert_eq!(
            interpret_exit(Some(-9), None),
            (Some(-9), Some("SIGKILL".to_string()))
        );
        assert_eq!(
            interpret_exit(None, Some(libc::SIGTERM)),
            (None, Some("SIGTERM".to_string()))
        );
    }

    #[test]
    fn test_signal_name_unknown() {
        assert_eq!(signal_name(64), "signal 64");
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("worker.stderr.log");
        std::fs::write(&path, "x".repeat(100) + "TAIL").unwrap();

        let tail = read_stderr_tail(&path, 4);
        assert_eq!(tail, "TAIL");

        let all = read_stderr_tail(&path, 10_000);
        assert_eq!(all.len(), 104);

        assert_eq!(read_stderr_tail(&dir.path().join("missing"), 10), "");
    }

    #[test]
    fn test_cmdline_matching() {
        let recorded = vec![
            "/usr/bin/flow-worker".to_string(),
            "--run-id".to_string(),
            "run-1".to_string(),
        ];

        let exact = recorded.clone();
        assert!(cmdline_matches(&exact, &recorded));

        // Interpreter wrapper prepended.
        let wrapped = vec![
            "/usr/bin/env".to_string(),
            "flow-worker".to_string(),
            "--run-id".to_string(),
            "run-1".to_string(),
        ];
        assert!(cmdline_matches(&wrapped, &recorded));

        // Different program entirely.
        let other = vec!["/usr/bin/sleep".to_string(), "60".to_string()];
        assert!(!cmdline_matches(&other, &recorded));

        // Same program, different run.
        let other_run = vec![
            "/usr/bin/flow-worker".to_string(),
            "--run-id".to_string(),
            "run-2".to_string(),
        ];
        assert!(!cmdline_matches(&other_run, &recorded));
    }
}
