//! The worker-side step loop.
//!
//! A worker drives exactly one run: it replays nothing, trusts the store
//! for all state, and advances step by step until the run reaches PAUSED
//! or a terminal status. Every transition is recorded as an event before
//! the loop moves on, so an observer tailing the event log sees the same
//! history the store does.
//!
//! The loop applies outcomes with *conditional* status updates: if the
//! store reports the run already terminal (an operator stopped it, a
//! sibling superseded it), the worker emits no terminal event of its own
//! and exits quietly. That is what keeps "exactly one terminal event per
//! run" true with concurrent stoppers.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::StatePaths;
use crate::definition::{FlowRegistry, StepOutcome};
use crate::dispatch;
use crate::store::{EventType, FlowStore, RunStatus};

/// How the step loop finished, from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// Run reached COMPLETED.
    Completed,
    /// Run reached FAILED.
    Failed { error: String },
    /// Run paused awaiting a resume.
    Paused,
    /// Run was stopped via the cooperative flag.
    Stopped,
    /// The run was already terminal when the worker looked; nothing done.
    AlreadyFinished,
}

/// Execute the step loop for `run_id` until pause or a terminal status.
///
/// # Errors
///
/// Returns error on store failures or when the run/definition is missing;
/// step-level failures are recorded on the run and reported as
/// [`RunExit::Failed`], not as an `Err`.
pub async fn run_steps(
    store: &FlowStore,
    registry: &FlowRegistry,
    paths: &StatePaths,
    run_id: &str,
) -> Result<RunExit> {
    let run = store
        .get_flow_run(run_id)
        .await?
        .with_context(|| format!("Flow run '{run_id}' not found"))?;

    if run.status.is_terminal() {
        info!(run_id, status = %run.status, "Run already finished, worker exiting");
        return Ok(RunExit::AlreadyFinished);
    }

    let definition = registry
        .get(&run.flow_type)
        .with_context(|| format!("No flow definition registered for '{}'", run.flow_type))?
        .clone();

    // flow_started is the first event of every run. A resumed run already
    // has it.
    if store.get_events_since(run_id, 0).await?.is_empty() {
        emit(
            store,
            run_id,
            EventType::FlowStarted,
            json!({ "flow_type": run.flow_type, "input": run.input }),
        )
        .await?;
    }

    let first_step = run
        .current_step
        .clone()
        .unwrap_or_else(|| definition.initial_step().to_string());

    let mut queue: VecDeque<String> = VecDeque::from([first_step]);

    while let Some(step_name) = queue.pop_front() {
        // Fresh snapshot each iteration: stop flags and state changes from
        // other processes must be visible to this step.
        let run = store
            .get_flow_run(run_id)
            .await?
            .with_context(|| format!("Flow run '{run_id}' vanished mid-loop"))?;

        if run.status.is_terminal() {
            return Ok(RunExit::AlreadyFinished);
        }

        if run.stop_requested {
            return apply_stop(store, run_id).await;
        }

        let Some(step) = definition.get_step(&step_name) else {
            return apply_failure(
                store,
                run_id,
                &step_name,
                &format!("step '{step_name}' is not defined for flow '{}'", run.flow_type),
            )
            .await;
        };

        store.set_current_step(run_id, &step_name).await?;
        emit(store, run_id, EventType::StepStarted, json!({ "step": step_name })).await?;

        let input = run.input.clone();
        let outcome = (step.func)(run, input).await;

        match outcome {
            StepOutcome::Continue { next_steps, output } => {
                if next_steps.is_empty() {
                    return apply_failure(
                        store,
                        run_id,
                        &step_name,
                        &format!("step '{step_name}' continued to no steps"),
                    )
                    .await;
                }
                if let Some(bad) = next_steps.iter().find(|n| !step.next_steps.contains(*n)) {
                    return apply_failure(
                        store,
                        run_id,
                        &step_name,
                        &format!("step '{step_name}' continued to undeclared step '{bad}'"),
                    )
                    .await;
                }

                // A rejected transition means the run went terminal while
                // the step was executing; emitting anything more would
                // put a non-terminal event after the terminal one.
                let changed = store
                    .update_flow_run_status(run_id, RunStatus::Running, Some(output))
                    .await?;
                if !changed {
                    return Ok(RunExit::AlreadyFinished);
                }
                emit(
                    store,
                    run_id,
                    EventType::StepCompleted,
                    json!({
                        "step": step_name,
                        "outcome": "continue",
                        "next_steps": next_steps,
                    }),
                )
                .await?;

                for next in next_steps {
                    queue.push_back(next);
                }
            }
            StepOutcome::Pause { output } => {
                let changed = store
                    .update_flow_run_status(run_id, RunStatus::Paused, Some(output))
                    .await?;
                if !changed {
                    return Ok(RunExit::AlreadyFinished);
                }
                emit(
                    store,
                    run_id,
                    EventType::StepCompleted,
                    json!({ "step": step_name, "outcome": "pause" }),
                )
                .await?;

                if let Err(e) =
                    dispatch::write_pause_notice(store, paths, run_id, &step_name).await
                {
                    warn!(run_id, error = %e, "Failed to write pause dispatch notice");
                }

                info!(run_id, step = step_name, "Run paused");
                return Ok(RunExit::Paused);
            }
            StepOutcome::Complete { output } => {
                let changed = store
                    .update_flow_run_status(run_id, RunStatus::Completed, Some(output))
                    .await?;
                if !changed {
                    return Ok(RunExit::AlreadyFinished);
                }
                emit(
                    store,
                    run_id,
                    EventType::FlowCompleted,
                    json!({ "step": step_name }),
                )
                .await?;
                info!(run_id, "Run completed");
                return Ok(RunExit::Completed);
            }
            StepOutcome::Fail { error } => {
                return apply_failure(store, run_id, &step_name, &error).await;
            }
        }
    }

    // The queue drained without a Complete. Treat as a definition bug.
    apply_failure(
        store,
        run_id,
        "",
        "step graph drained without a completing step",
    )
    .await
}

/// Record a stop: conditional STOPPED transition plus at most one
/// `flow_stopped` event.
async fn apply_stop(store: &FlowStore, run_id: &str) -> Result<RunExit> {
    let changed = store
        .update_flow_run_status(run_id, RunStatus::Stopped, None)
        .await?;
    if !changed {
        return Ok(RunExit::AlreadyFinished);
    }
    emit(store, run_id, EventType::FlowStopped, json!({ "reason": "stop_requested" })).await?;
    info!(run_id, "Run stopped");
    Ok(RunExit::Stopped)
}

/// Record a step failure: conditional FAILED transition, error column,
/// `step_failed`, and exactly one `flow_failed` event.
async fn apply_failure(
    store: &FlowStore,
    run_id: &str,
    step: &str,
    error: &str,
) -> Result<RunExit> {
    let changed = store
        .update_flow_run_status(run_id, RunStatus::Failed, None)
        .await?;
    if !changed {
        return Ok(RunExit::AlreadyFinished);
    }

    store.set_error(run_id, error).await?;
    if !step.is_empty() {
        emit(
            store,
            run_id,
            EventType::StepFailed,
            json!({ "step": step, "error": error }),
        )
        .await?;
    }
    emit(store, run_id, EventType::FlowFailed, json!({ "error": error })).await?;

    warn!(run_id, step, error, "Run failed");
    Ok(RunExit::Failed {
        error: error.to_string(),
    })
}

async fn emit(
    store: &FlowStore,
    run_id: &str,
    event_type: EventType,
    data: serde_json::Value,
) -> Result<()> {
    store
        .create_event(&Uuid::new_v4().to_string(), run_id, event_type, data)
        .await?;
    Ok(())
}

/// Command-line arguments of a worker process.
#[derive(Debug, Parser)]
#[command(name = "flow-worker", about = "Out-of-process flow step worker")]
pub struct WorkerArgs {
    /// Run to drive.
    #[arg(long)]
    pub run_id: String,
    /// State root containing flows.db and per-run files.
    #[arg(long)]
    pub state_root: std::path::PathBuf,
    /// Repository root the flow operates on.
    #[arg(long, default_value = ".")]
    pub repo_root: std::path::PathBuf,
    /// Flush every store write.
    #[arg(long, default_value_t = false)]
    pub durable: bool,
}

/// Entry point for an embedder's worker binary.
///
/// A binary crate wires its own registry and delegates:
///
/// ```rust,ignore
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut registry = FlowRegistry::new();
///     registry.register(my_flow())?;
///     flow_engine::worker::runner::worker_main(registry).await
/// }
/// ```
///
/// # Errors
///
/// Returns error when the store cannot be opened or the run is missing;
/// the process exit code then reports the failure to the spawning engine.
pub async fn worker_main(registry: FlowRegistry) -> Result<()> {
    let args = WorkerArgs::parse();
    crate::logging::init("flow_engine=info");

    let paths = StatePaths::new(&args.state_root);
    let mut store = FlowStore::new(paths.db_path()).await?;
    if args.durable {
        store = store.with_durability(crate::store::Durability::Full);
    }

    let exit = run_steps(&store, &registry, &paths, &args.run_id).await?;
    info!(run_id = %args.run_id, exit = ?exit, "Worker finished");

    // Clean exit: the worker record no longer describes a live process.
    let record_path = paths.worker_record_path(&args.run_id);
    if record_path.exists() {
        let _ = std::fs::remove_file(&record_path);
    }

    Ok(())
}
