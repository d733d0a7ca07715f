//! Reconciliation of recorded state against observed worker liveness.
//!
//! The store says a run is RUNNING; the only proof is a live worker
//! process. The reconciler compares the two on demand (status reads,
//! engine startup) and repairs the store when they disagree: a RUNNING
//! run whose worker is gone gets a crash report, a dispatch notice, and
//! is parked PAUSED so an operator can resume it. A PAUSED run whose
//! recorded worker turns out dead gets the same report and notice but
//! keeps its status.
//!
//! Reconciliation never kills processes and never deletes run data; its
//! only destructive act is removing a worker record that provably
//! describes a dead process.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::StatePaths;
use crate::dispatch;
use crate::store::{EventType, FlowRun, FlowStore, RunStatus};
use crate::worker::{
    check_worker_health, interpret_exit, read_stderr_tail, CrashReport, WorkerHealth, WorkerRecord,
};

/// Exit details collected by whoever spawned the worker. Detached workers
/// reaped by init leave nothing to collect.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectedExit {
    /// Raw exit code, if any.
    pub code: Option<i32>,
    /// Raw terminating signal number, if any.
    pub signal: Option<i32>,
}

/// Outcome of reconciling one run.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// The run, re-read after any repair.
    pub run: FlowRun,
    /// True when reconciliation changed persisted state.
    pub state_changed: bool,
    /// True when a live worker still holds the run.
    pub lock_held: bool,
}

/// Reconcile a single run against its worker record.
///
/// `collected_exit` carries exit details when the caller (the process
/// launcher) managed to reap the worker itself.
///
/// # Errors
///
/// Returns error if the run is missing or a store operation fails.
pub async fn reconcile_run(
    store: &FlowStore,
    paths: &StatePaths,
    run_id: &str,
    collected_exit: Option<CollectedExit>,
) -> Result<Reconciliation> {
    let run = store
        .get_flow_run(run_id)
        .await?
        .with_context(|| format!("Flow run '{run_id}' not found"))?;

    let record_path = paths.worker_record_path(run_id);
    let record = match WorkerRecord::read(&record_path) {
        Ok(record) => record,
        Err(e) => {
            // A malformed record cannot prove a live worker. Treat it the
            // same as no record, but keep the file for inspection.
            warn!(run_id, error = %e, "Worker record unreadable");
            None
        }
    };

    if run.status.is_terminal() {
        // Nothing to repair. A leftover record for a finished run is
        // stale; drop it once its process is provably gone.
        if let Some(record) = &record {
            if check_worker_health(record) == WorkerHealth::Dead {
                let _ = std::fs::remove_file(&record_path);
            }
        }
        return Ok(Reconciliation {
            run,
            state_changed: false,
            lock_held: false,
        });
    }

    if run.status == RunStatus::Paused {
        // A paused run should have no worker. A record pointing at a dead
        // process means the worker died instead of exiting cleanly: write
        // the crash report and dispatch notice (once), keep the run
        // PAUSED, and drop the record.
        if let Some(record) = &record {
            match check_worker_health(record) {
                WorkerHealth::Alive | WorkerHealth::Unknown => {
                    return Ok(Reconciliation {
                        run,
                        state_changed: false,
                        lock_held: true,
                    });
                }
                WorkerHealth::Dead => {
                    let mut state_changed = false;
                    if !paths.crash_report_path(run_id).exists() {
                        record_crash(store, paths, run_id, Some(record), collected_exit)
                            .await?;
                        state_changed = true;
                    }
                    let _ = std::fs::remove_file(&record_path);
                    return Ok(Reconciliation {
                        run,
                        state_changed,
                        lock_held: false,
                    });
                }
            }
        }
        return Ok(Reconciliation {
            run,
            state_changed: false,
            lock_held: false,
        });
    }

    // PENDING or RUNNING from here on.
    let Some(record) = record else {
        if run.status == RunStatus::Pending {
            // Worker not yet spawned; nothing to check.
            return Ok(Reconciliation {
                run,
                state_changed: false,
                lock_held: false,
            });
        }
        // RUNNING with no record: the worker died before (or while)
        // writing its record, or the record was lost.
        let run = repair_crashed_run(store, paths, run_id, None, collected_exit).await?;
        return Ok(Reconciliation {
            run,
            state_changed: true,
            lock_held: false,
        });
    };

    match check_worker_health(&record) {
        WorkerHealth::Alive => Ok(Reconciliation {
            run,
            state_changed: false,
            lock_held: true,
        }),
        // Cannot prove death; leave the run alone rather than parking a
        // run whose worker may still be working.
        WorkerHealth::Unknown => Ok(Reconciliation {
            run,
            state_changed: false,
            lock_held: true,
        }),
        WorkerHealth::Dead => {
            let run =
                repair_crashed_run(store, paths, run_id, Some(&record), collected_exit).await?;
            let _ = std::fs::remove_file(&record_path);
            Ok(Reconciliation {
                run,
                state_changed: true,
                lock_held: false,
            })
        }
    }
}

/// Reconcile every PENDING and RUNNING run. Used at engine startup to
/// sweep up runs orphaned by a previous engine crash.
///
/// # Errors
///
/// Returns error if listing runs fails; per-run repair failures are
/// logged and skipped so one bad run does not block the sweep.
pub async fn reconcile_active(store: &FlowStore, paths: &StatePaths) -> Result<Vec<Reconciliation>> {
    let mut results = Vec::new();
    for status in [RunStatus::Running, RunStatus::Pending] {
        for run in store.list_flow_runs(None, Some(status)).await? {
            match reconcile_run(store, paths, &run.run_id, None).await {
                Ok(reconciliation) => results.push(reconciliation),
                Err(e) => {
                    warn!(run_id = %run.run_id, error = %e, "Failed to reconcile run");
                }
            }
        }
    }
    Ok(results)
}

/// Persist `crash.json` and the crash dispatch notice for a dead worker.
/// File and notice writes are best effort; the report is returned either
/// way so callers can log it.
async fn record_crash(
    store: &FlowStore,
    paths: &StatePaths,
    run_id: &str,
    record: Option<&WorkerRecord>,
    collected_exit: Option<CollectedExit>,
) -> Result<CrashReport> {
    let exit = collected_exit.unwrap_or_default();
    let (exit_code, signal) = interpret_exit(exit.code, exit.signal);

    let last_event = store
        .get_events(run_id)
        .await?
        .last()
        .map(|e| json!({ "event_type": e.event_type, "sequence": e.sequence, "data": e.data }));

    let report = CrashReport {
        worker_pid: record.map_or(0, |r| r.pid),
        exit_code,
        signal,
        last_event,
        stderr_tail: read_stderr_tail(&paths.stderr_log_path(run_id), 4096),
        detected_at: chrono::Utc::now().to_rfc3339(),
    };

    if let Err(e) = report.write(&paths.crash_report_path(run_id)) {
        warn!(run_id, error = %e, "Failed to persist crash report");
    }
    if let Err(e) = dispatch::write_crash_notice(store, paths, run_id, &report).await {
        warn!(run_id, error = %e, "Failed to write crash dispatch notice");
    }

    Ok(report)
}

/// Park a crashed run: persist `crash.json`, append a `step_failed`
/// event, write the crash dispatch notice, and set the run PAUSED.
async fn repair_crashed_run(
    store: &FlowStore,
    paths: &StatePaths,
    run_id: &str,
    record: Option<&WorkerRecord>,
    collected_exit: Option<CollectedExit>,
) -> Result<FlowRun> {
    let report = record_crash(store, paths, run_id, record, collected_exit).await?;

    info!(
        run_id,
        pid = report.worker_pid,
        signal = report.signal.as_deref().unwrap_or(""),
        "Worker died mid-run, parking run as paused"
    );

    // A worker that died before emitting anything leaves an empty log;
    // appending step_failed there would break "the log opens with
    // flow_started". The crash report alone carries the evidence.
    if report.last_event.is_some() {
        store
            .create_event(
                &Uuid::new_v4().to_string(),
                run_id,
                EventType::StepFailed,
                json!({
                    "step": "",
                    "error": "worker process died",
                    "worker_pid": report.worker_pid,
                    "signal": report.signal,
                }),
            )
            .await?;
    }

    store
        .update_flow_run_status(run_id, RunStatus::Paused, None)
        .await?;

    store
        .get_flow_run(run_id)
        .await?
        .with_context(|| format!("Flow run '{run_id}' vanished during repair"))
}
