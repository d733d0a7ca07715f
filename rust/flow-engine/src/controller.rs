//! Run controller: start, stop, resume, status, streaming.
//!
//! The controller is the single entry point callers use to drive runs. It
//! owns no run state itself; everything durable lives in the store, and
//! every status answer is reconciled against observed worker liveness
//! before it is returned.
//!
//! Worker execution is behind the [`WorkerLauncher`] seam. Production
//! uses [`ProcessWorkerLauncher`] (detached OS processes surviving engine
//! restarts); tests and single-process embedders use
//! [`EmbeddedLauncher`], which drives the same step loop on a tokio task.

use std::collections::HashMap;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::Stream;
use serde_json::{json, Value};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, StatePaths};
use crate::definition::FlowRegistry;
use crate::error::{FlowError, FlowResult};
use crate::reconciler::{self, CollectedExit, Reconciliation};
use crate::store::{
    Artifact, EventType, FlowEvent, FlowRun, FlowStore, ResumeAdmission, RunStatus,
};
use crate::worker::{runner, terminate_worker, WorkerRecord};

/// Result of a start request.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    /// The run now driving the flow type.
    pub run: FlowRun,
    /// True when an existing active sibling was returned instead of a new
    /// run being created.
    pub reused: bool,
    /// Paused siblings retired by this start.
    pub superseded: Vec<String>,
}

/// Spawns and tracks workers for admitted runs.
#[async_trait]
pub trait WorkerLauncher: Send + Sync + fmt::Debug {
    /// Launch a worker for `run` and persist its worker record.
    async fn launch(&self, run: &FlowRun) -> FlowResult<WorkerRecord>;

    /// Exit details for a worker this launcher spawned, when collectable.
    async fn collect_exit(&self, run_id: &str) -> Option<CollectedExit>;
}

/// Launches workers as detached OS processes.
///
/// Workers are spawned into their own process group with stderr captured
/// to the per-run log, so they survive an engine restart and can be
/// stopped as a group. The `Child` handles are retained to reap exit
/// statuses for crash reports; a restarted engine loses them, which is
/// why crash reports carry `exit_code` as an `Option`.
pub struct ProcessWorkerLauncher {
    config: EngineConfig,
    paths: StatePaths,
    children: Mutex<HashMap<String, Child>>,
}

impl fmt::Debug for ProcessWorkerLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessWorkerLauncher")
            .field("worker_command", &self.config.worker_command)
            .finish_non_exhaustive()
    }
}

impl ProcessWorkerLauncher {
    /// Create a launcher from engine configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let paths = config.paths();
        Self {
            config,
            paths,
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessWorkerLauncher {
    async fn launch(&self, run: &FlowRun) -> FlowResult<WorkerRecord> {
        let Some((program, base_args)) = self.config.worker_command.split_first() else {
            return Err(FlowError::WorkerLaunch {
                run_id: run.run_id.clone(),
                reason: "no worker command configured".to_string(),
            });
        };

        let run_dir = self.paths.run_dir(&run.run_id);
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create {}", run_dir.display()))?;

        let stderr_path = self.paths.stderr_log_path(&run.run_id);
        let stderr_file = std::fs::File::create(&stderr_path)
            .with_context(|| format!("Failed to create {}", stderr_path.display()))?;

        let mut argv: Vec<String> = self.config.worker_command.clone();
        argv.extend([
            "--run-id".to_string(),
            run.run_id.clone(),
            "--state-root".to_string(),
            self.paths.root().to_string_lossy().into_owned(),
            "--repo-root".to_string(),
            self.config.repo_root.to_string_lossy().into_owned(),
        ]);
        if self.config.durable {
            argv.push("--durable".to_string());
        }

        let mut command = Command::new(program);
        command
            .args(base_args)
            .args(&argv[self.config.worker_command.len()..])
            .current_dir(&self.config.repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            // Own process group: detached from the engine's signals, and
            // stoppable as a unit with killpg.
            .process_group(0)
            .kill_on_drop(false);

        let child = command.spawn().map_err(|e| FlowError::WorkerLaunch {
            run_id: run.run_id.clone(),
            reason: format!("failed to spawn '{program}': {e}"),
        })?;

        let pid = child.id().ok_or_else(|| FlowError::WorkerLaunch {
            run_id: run.run_id.clone(),
            reason: "worker exited before a pid was observed".to_string(),
        })?;

        let record = WorkerRecord {
            run_id: run.run_id.clone(),
            pid,
            cmd: argv,
            repo_root: self.config.repo_root.to_string_lossy().into_owned(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        record
            .write(&self.paths.worker_record_path(&run.run_id))
            .context("Failed to persist worker record")?;

        self.children.lock().await.insert(run.run_id.clone(), child);
        info!(run_id = %run.run_id, pid, "Spawned flow worker");

        Ok(record)
    }

    async fn collect_exit(&self, run_id: &str) -> Option<CollectedExit> {
        use std::os::unix::process::ExitStatusExt;

        let mut children = self.children.lock().await;
        let child = children.get_mut(run_id)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                children.remove(run_id);
                Some(CollectedExit {
                    code: status.code(),
                    signal: status.signal(),
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(run_id, error = %e, "Failed to poll worker exit status");
                None
            }
        }
    }
}

/// Drives the step loop on an in-process tokio task.
///
/// The worker record points at the engine's own pid, so liveness checks
/// behave the same way they do for real workers.
pub struct EmbeddedLauncher {
    store: FlowStore,
    registry: FlowRegistry,
    paths: StatePaths,
}

impl fmt::Debug for EmbeddedLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedLauncher").finish_non_exhaustive()
    }
}

impl EmbeddedLauncher {
    /// Create an embedded launcher sharing the engine's store and registry.
    #[must_use]
    pub fn new(store: FlowStore, registry: FlowRegistry, paths: StatePaths) -> Self {
        Self {
            store,
            registry,
            paths,
        }
    }
}

#[async_trait]
impl WorkerLauncher for EmbeddedLauncher {
    async fn launch(&self, run: &FlowRun) -> FlowResult<WorkerRecord> {
        let exe = std::env::current_exe()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "embedded".to_string());

        let record = WorkerRecord {
            run_id: run.run_id.clone(),
            pid: std::process::id(),
            cmd: vec![exe],
            repo_root: ".".to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        let record_path = self.paths.worker_record_path(&run.run_id);
        record
            .write(&record_path)
            .context("Failed to persist worker record")?;

        let store = self.store.clone();
        let registry = self.registry.clone();
        let paths = self.paths.clone();
        let run_id = run.run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = runner::run_steps(&store, &registry, &paths, &run_id).await {
                warn!(run_id = %run_id, error = %e, "Embedded worker failed");
            }
            let _ = std::fs::remove_file(paths.worker_record_path(&run_id));
        });

        Ok(record)
    }

    async fn collect_exit(&self, _run_id: &str) -> Option<CollectedExit> {
        None
    }
}

/// The run-facing orchestration API.
#[derive(Debug, Clone)]
pub struct FlowController {
    store: FlowStore,
    registry: FlowRegistry,
    config: EngineConfig,
    paths: StatePaths,
    launcher: Arc<dyn WorkerLauncher>,
}

impl FlowController {
    /// Create a controller over an opened store.
    #[must_use]
    pub fn new(
        store: FlowStore,
        registry: FlowRegistry,
        config: EngineConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let paths = config.paths();
        Self {
            store,
            registry,
            config,
            paths,
            launcher,
        }
    }

    /// Controller wired for single-process use: embedded workers sharing
    /// the controller's store and registry.
    #[must_use]
    pub fn embedded(store: FlowStore, registry: FlowRegistry, config: EngineConfig) -> Self {
        let launcher = Arc::new(EmbeddedLauncher::new(
            store.clone(),
            registry.clone(),
            config.paths(),
        ));
        Self::new(store, registry, config, launcher)
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &FlowStore {
        &self.store
    }

    /// The state layout in use.
    #[must_use]
    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// Registered flow types.
    #[must_use]
    pub fn flow_types(&self) -> Vec<&str> {
        self.registry.flow_types()
    }

    /// Start a run of `flow_type`.
    ///
    /// Admission is atomic: at most one PENDING/RUNNING run per flow type.
    /// An existing active sibling is returned with `reused = true` unless
    /// `metadata.force_new` is set. Paused siblings are retired.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::UnknownFlowType`] for unregistered types and
    /// [`FlowError::WorkerLaunch`] when the worker cannot be spawned (the
    /// run is then marked FAILED).
    pub async fn start_flow(
        &self,
        flow_type: &str,
        input: Value,
        metadata: Option<Value>,
    ) -> FlowResult<StartOutcome> {
        if self.registry.get(flow_type).is_none() {
            return Err(FlowError::UnknownFlowType(flow_type.to_string()));
        }

        let run_id = Uuid::new_v4().to_string();
        let admission = self
            .store
            .admit_flow_run(&run_id, flow_type, input, metadata)
            .await?;

        if admission.reused {
            info!(
                flow_type,
                run_id = %admission.run.run_id,
                "Reusing active run instead of starting a new one"
            );
            return Ok(StartOutcome {
                run: admission.run,
                reused: true,
                superseded: admission.superseded,
            });
        }

        for superseded in &admission.superseded {
            info!(flow_type, run_id = %superseded, superseded_by = %run_id, "Superseded paused run");
        }

        match self.launcher.launch(&admission.run).await {
            Ok(_) => Ok(StartOutcome {
                run: admission.run,
                reused: false,
                superseded: admission.superseded,
            }),
            Err(e) => {
                self.fail_unlaunchable(&run_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Stop a run: set the cooperative flag, terminate its worker after
    /// the configured grace window, and record the STOPPED transition.
    ///
    /// Stopping an already-terminal run is a no-op returning the run.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::RunNotFound`] for unknown ids.
    pub async fn stop_flow(&self, run_id: &str) -> FlowResult<FlowRun> {
        let run = self
            .store
            .get_flow_run(run_id)
            .await?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;

        if run.status.is_terminal() {
            return Ok(run);
        }

        self.store.set_stop_requested(run_id, true).await?;

        let record_path = self.paths.worker_record_path(run_id);
        if let Ok(Some(record)) = WorkerRecord::read(&record_path) {
            // Embedded workers share this process; they stop via the
            // cooperative flag, never via signals.
            if record.pid != std::process::id() {
                terminate_worker(&record, self.config.stop_grace()).await;
                // Reap the child if we spawned it.
                let _ = self.launcher.collect_exit(run_id).await;
                let _ = std::fs::remove_file(&record_path);
            }
        }

        let changed = self
            .store
            .update_flow_run_status(run_id, RunStatus::Stopped, None)
            .await?;
        if changed {
            self.store
                .create_event(
                    &Uuid::new_v4().to_string(),
                    run_id,
                    EventType::FlowStopped,
                    json!({ "reason": "stop_requested" }),
                )
                .await?;
        }

        self.store
            .get_flow_run(run_id)
            .await?
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))
    }

    /// Resume a PAUSED (or STOPPED) run.
    ///
    /// `force` bypasses the active-sibling check and clears any stale
    /// worker record before relaunching.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Superseded`], [`FlowError::AlreadyActive`],
    /// [`FlowError::NotResumable`], or [`FlowError::RunNotFound`] per the
    /// admission outcome.
    pub async fn resume_flow(&self, run_id: &str, force: bool) -> FlowResult<FlowRun> {
        let run = match self.store.admit_resume(run_id, force).await? {
            ResumeAdmission::Resumed(run) => run,
            ResumeAdmission::NotFound => {
                return Err(FlowError::RunNotFound(run_id.to_string()));
            }
            ResumeAdmission::Superseded { superseded_by } => {
                return Err(FlowError::Superseded {
                    run_id: run_id.to_string(),
                    superseded_by,
                });
            }
            ResumeAdmission::AlreadyActive { active_run_id } => {
                let flow_type = self
                    .store
                    .get_flow_run(run_id)
                    .await?
                    .map(|r| r.flow_type)
                    .unwrap_or_default();
                return Err(FlowError::AlreadyActive {
                    flow_type,
                    active_run_id,
                });
            }
            ResumeAdmission::NotResumable { status } => {
                return Err(FlowError::NotResumable {
                    run_id: run_id.to_string(),
                    status,
                });
            }
        };

        if force {
            let _ = std::fs::remove_file(self.paths.worker_record_path(run_id));
        }

        match self.launcher.launch(&run).await {
            Ok(_) => Ok(run),
            Err(e) => {
                self.fail_unlaunchable(run_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Status of a run, reconciled against worker liveness first.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::RunNotFound`] for unknown ids.
    pub async fn get_status(&self, run_id: &str) -> FlowResult<Reconciliation> {
        if self.store.get_flow_run(run_id).await?.is_none() {
            return Err(FlowError::RunNotFound(run_id.to_string()));
        }

        let collected = self.launcher.collect_exit(run_id).await;
        let reconciliation = reconciler::reconcile_run(&self.store, &self.paths, run_id, collected)
            .await?;
        Ok(reconciliation)
    }

    /// List runs, optionally filtered.
    ///
    /// # Errors
    ///
    /// Returns error if the store operation fails.
    pub async fn list_runs(
        &self,
        flow_type: Option<&str>,
        status: Option<RunStatus>,
    ) -> FlowResult<Vec<FlowRun>> {
        Ok(self.store.list_flow_runs(flow_type, status).await?)
    }

    /// Artifacts recorded for a run.
    ///
    /// # Errors
    ///
    /// Returns error if the store operation fails.
    pub async fn get_artifacts(&self, run_id: &str) -> FlowResult<Vec<Artifact>> {
        Ok(self.store.get_artifacts(run_id).await?)
    }

    /// Stream a run's events from `since` onward, then follow the live
    /// tail until the run reaches a terminal status.
    ///
    /// The stream is purely store-driven: it polls the event table at the
    /// configured interval, so it works across processes and across
    /// engine restarts.
    pub fn stream_events(
        &self,
        run_id: String,
        since: u64,
    ) -> impl Stream<Item = FlowResult<FlowEvent>> + Send {
        let store = self.store.clone();
        let interval = self.config.poll_interval();

        async_stream::try_stream! {
            let mut cursor = since;
            loop {
                let events = store.get_events_since(&run_id, cursor).await?;
                for event in events {
                    cursor = event.sequence + 1;
                    let terminal = event.event_type.is_terminal();
                    yield event;
                    if terminal {
                        return;
                    }
                }

                let run = store
                    .get_flow_run(&run_id)
                    .await?
                    .ok_or_else(|| FlowError::RunNotFound(run_id.clone()))?;
                // Terminal without a terminal event means the run was
                // repaired or superseded; nothing more will arrive.
                if run.status.is_terminal() {
                    return;
                }

                tokio::time::sleep(interval).await;
            }
        }
    }

    /// Stop every worker this engine knows about. Called on shutdown.
    ///
    /// Runs stay RUNNING in the store; the next engine start reconciles
    /// them (finding dead workers) and parks them PAUSED.
    pub async fn shutdown(&self) {
        let running = match self.store.list_flow_runs(None, Some(RunStatus::Running)).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "Failed to list running runs during shutdown");
                return;
            }
        };

        for run in running {
            let record_path = self.paths.worker_record_path(&run.run_id);
            if let Ok(Some(record)) = WorkerRecord::read(&record_path) {
                if record.pid != std::process::id() {
                    terminate_worker(&record, self.config.stop_grace()).await;
                    let _ = self.launcher.collect_exit(&run.run_id).await;
                }
            }
        }
    }

    async fn fail_unlaunchable(&self, run_id: &str, reason: &str) -> FlowResult<()> {
        warn!(run_id, reason, "Worker launch failed, failing run");
        self.store.set_error(run_id, reason).await?;
        let changed = self
            .store
            .update_flow_run_status(run_id, RunStatus::Failed, None)
            .await?;
        if changed {
            self.store
                .create_event(
                    &Uuid::new_v4().to_string(),
                    run_id,
                    EventType::FlowFailed,
                    json!({ "error": reason }),
                )
                .await?;
        }
        Ok(())
    }
}
