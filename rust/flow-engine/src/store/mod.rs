//! `SQLite` run store for durable flow orchestration.
//!
//! The store is the only component permitted to mutate persisted run,
//! event, and artifact state, and it is the synchronization point across
//! OS processes. Admission sequences ("check no running sibling, then
//! admit/supersede") run inside a single `BEGIN IMMEDIATE` transaction so
//! two CLI invocations sharing one state directory cannot both win.
//!
//! # Features
//!
//! - **WAL mode**: Write-Ahead Logging enabled for concurrent reads/writes
//! - **Durable mode**: optional `synchronous = FULL` flush on every write
//! - **Append-only events**: per-run sequence numbers allocated transactionally
//! - **Schema migration**: automatic table creation
//!
//! # Thread Safety
//!
//! Each operation opens its own connection in a blocking thread pool,
//! ensuring thread safety without shared state. `SQLite`'s WAL mode handles
//! concurrent access transparently.

pub mod recovery;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task;

/// Run status enum.
///
/// Transitions follow the state machine: `PENDING -> RUNNING ->
/// {PAUSED, COMPLETED, FAILED, STOPPED}`; `PAUSED -> RUNNING` on resume or
/// `PAUSED -> SUPERSEDED` when a sibling run starts; any non-terminal
/// state `-> STOPPED` via explicit stop. Resume may also revive a STOPPED
/// run back to RUNNING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created, worker not yet launched.
    Pending,
    /// A worker is (expected to be) driving the step loop.
    Running,
    /// Step loop suspended until an explicit resume.
    Paused,
    /// Run finished successfully. Terminal.
    Completed,
    /// Run failed. Terminal.
    Failed,
    /// Run stopped by explicit request. Terminal (but resumable).
    Stopped,
    /// Run retired because a newer sibling started. Terminal.
    Superseded,
}

impl RunStatus {
    /// Convert status to string for database storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Superseded => "superseded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the status string is invalid.
    #[allow(clippy::should_implement_trait, reason = "Different signature than std::str::FromStr")]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "superseded" => Ok(Self::Superseded),
            _ => anyhow::bail!("Invalid run status: {s}"),
        }
    }

    /// True for COMPLETED, FAILED, STOPPED, and SUPERSEDED.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Superseded
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event types recorded for a run, in the order the engine emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// First event of every run.
    FlowStarted,
    /// A step began executing.
    StepStarted,
    /// A step finished with Continue/Pause/Complete.
    StepCompleted,
    /// A step returned Fail.
    StepFailed,
    /// Run completed. Terminal.
    FlowCompleted,
    /// Run failed. Terminal.
    FlowFailed,
    /// Run stopped. Terminal.
    FlowStopped,
}

impl EventType {
    /// Convert event type to string for database storage.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlowStarted => "flow_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::FlowCompleted => "flow_completed",
            Self::FlowFailed => "flow_failed",
            Self::FlowStopped => "flow_stopped",
        }
    }

    /// Parse event type from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the event type string is invalid.
    #[allow(clippy::should_implement_trait, reason = "Different signature than std::str::FromStr")]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "flow_started" => Ok(Self::FlowStarted),
            "step_started" => Ok(Self::StepStarted),
            "step_completed" => Ok(Self::StepCompleted),
            "step_failed" => Ok(Self::StepFailed),
            "flow_completed" => Ok(Self::FlowCompleted),
            "flow_failed" => Ok(Self::FlowFailed),
            "flow_stopped" => Ok(Self::FlowStopped),
            _ => anyhow::bail!("Invalid event type: {s}"),
        }
    }

    /// True for the exactly-one-last event types.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FlowCompleted | Self::FlowFailed | Self::FlowStopped)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution instance of a flow type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    /// Opaque unique run identifier.
    pub run_id: String,
    /// Flow type tag.
    pub flow_type: String,
    /// Current status.
    pub status: RunStatus,
    /// Name of the step the worker is (or was last) executing.
    pub current_step: Option<String>,
    /// Opaque input payload.
    pub input: Value,
    /// Accumulated state merged from step outputs.
    pub state: Value,
    /// Opaque key/value bag (`force_new`, supersession bookkeeping).
    pub metadata: Value,
    /// Error message when the run failed.
    pub error: Option<String>,
    /// Cooperative stop flag checked by well-behaved steps.
    pub stop_requested: bool,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
    /// Timestamp the run first transitioned to RUNNING.
    pub started_at: Option<i64>,
    /// Set iff the status is terminal.
    pub finished_at: Option<i64>,
}

impl FlowRun {
    /// Convenience accessor for the superseding run id, if any.
    #[must_use]
    pub fn superseded_by(&self) -> Option<&str> {
        self.metadata.get("superseded_by").and_then(Value::as_str)
    }

    /// True when `metadata.force_new` is set truthy.
    #[must_use]
    pub fn force_new(&self) -> bool {
        self.metadata
            .get("force_new")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// An immutable, append-only record of something that happened to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Opaque unique event identifier.
    pub event_id: String,
    /// Owning run.
    pub run_id: String,
    /// Monotonically increasing sequence within the run.
    pub sequence: u64,
    /// Event type.
    pub event_type: EventType,
    /// Opaque payload.
    pub data: Value,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// A named, typed side output of a run (dispatch notice, crash report).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Opaque unique artifact identifier.
    pub artifact_id: String,
    /// Owning run.
    pub run_id: String,
    /// Artifact kind (e.g. `worker_crash`, `pause_dispatch`).
    pub kind: String,
    /// Filesystem path of the artifact content.
    pub path: String,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// Result of the atomic start-flow admission.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The admitted (or reused) run.
    pub run: FlowRun,
    /// True when an existing non-terminal sibling was returned instead of
    /// creating a new run.
    pub reused: bool,
    /// Run ids of paused siblings retired by this admission.
    pub superseded: Vec<String>,
}

/// Result of the atomic resume admission.
#[derive(Debug, Clone)]
pub enum ResumeAdmission {
    /// Run transitioned back to RUNNING.
    Resumed(FlowRun),
    /// No such run.
    NotFound,
    /// The run was retired by a newer sibling.
    Superseded { superseded_by: String },
    /// Another run of the same type is currently running.
    AlreadyActive { active_run_id: String },
    /// The run's status does not permit resuming.
    NotResumable { status: RunStatus },
}

/// Write-flush policy for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// `synchronous = NORMAL`: optimized for throughput.
    #[default]
    Normal,
    /// `synchronous = FULL`: fsync every write.
    Full,
}

/// SQLite-backed store for runs, events, and artifacts.
///
/// Runs are never physically deleted by the engine; retention is an
/// external concern.
#[derive(Debug, Clone)]
pub struct FlowStore {
    /// Path to the `flows.db` file.
    db_path: PathBuf,
    /// Flush policy applied to every connection.
    durability: Durability,
}

const TERMINAL_STATUSES: &str = "('completed', 'failed', 'stopped', 'superseded')";

impl FlowStore {
    /// Open (or create) a store at `path` and migrate the schema.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be opened, WAL mode cannot be
    /// enabled, or migration fails.
    pub async fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let store = Self {
            db_path: path.into(),
            durability: Durability::Normal,
        };

        store.migrate_schema().await?;

        Ok(store)
    }

    /// Switch the flush policy. `Durability::Full` trades latency for a
    /// stronger crash guarantee.
    #[must_use]
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    fn open_conn(db_path: &std::path::Path, durability: Durability) -> Result<Connection> {
        let conn = Connection::open(db_path).context("Failed to open flows database")?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        let sync = match durability {
            Durability::Normal => "NORMAL",
            Durability::Full => "FULL",
        };
        conn.pragma_update(None, "synchronous", sync)
            .context("Failed to set synchronous pragma")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;

        Ok(conn)
    }

    /// Migrate database schema to the latest version.
    async fn migrate_schema(&self) -> Result<()> {
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<()> {
            let conn = Self::open_conn(&db_path, durability)?;

            conn.execute(
                r"
                CREATE TABLE IF NOT EXISTS flow_runs (
                    run_id TEXT PRIMARY KEY,
                    flow_type TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_step TEXT,
                    input TEXT NOT NULL,
                    state TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    error TEXT,
                    stop_requested INTEGER NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    started_at INTEGER,
                    finished_at INTEGER
                )
                ",
                [],
            )
            .context("Failed to create flow_runs table")?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_flow_runs_type ON flow_runs(flow_type)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_flow_runs_status ON flow_runs(status)",
                [],
            )?;

            conn.execute(
                r"
                CREATE TABLE IF NOT EXISTS flow_events (
                    event_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    sequence INTEGER NOT NULL,
                    event_type TEXT NOT NULL,
                    data TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE(run_id, sequence)
                )
                ",
                [],
            )
            .context("Failed to create flow_events table")?;

            conn.execute(
                r"
                CREATE INDEX IF NOT EXISTS idx_flow_events_run
                ON flow_events(run_id, sequence)
                ",
                [],
            )?;

            conn.execute(
                r"
                CREATE TABLE IF NOT EXISTS flow_artifacts (
                    artifact_id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    path TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                )
                ",
                [],
            )
            .context("Failed to create flow_artifacts table")?;

            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_flow_artifacts_run ON flow_artifacts(run_id)",
                [],
            )?;

            Ok(())
        })
        .await
        .context("Failed to spawn blocking task")??;

        Ok(())
    }

    /// Create a new flow run in PENDING status.
    ///
    /// # Errors
    ///
    /// Returns error if the run id already exists or the insert fails.
    pub async fn create_flow_run(
        &self,
        run_id: &str,
        flow_type: &str,
        input: Value,
        metadata: Option<Value>,
        state: Option<Value>,
        current_step: Option<&str>,
    ) -> Result<FlowRun> {
        let run_id = run_id.to_string();
        let flow_type = flow_type.to_string();
        let current_step = current_step.map(ToString::to_string);
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<FlowRun> {
            let conn = Self::open_conn(&db_path, durability)?;
            let now = chrono::Utc::now().timestamp();

            insert_run(
                &conn,
                &run_id,
                &flow_type,
                &input,
                metadata.as_ref(),
                state.as_ref(),
                current_step.as_deref(),
                now,
            )?;

            query_run(&conn, &run_id)?.context("Run vanished immediately after insert")
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Update a run's status, optionally merging a state patch.
    ///
    /// No-op (returns `false`) when the run is absent or already in a
    /// terminal status, protecting the state machine's terminal states.
    /// Transitions to RUNNING from a terminal state go through
    /// [`Self::admit_resume`] instead.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn update_flow_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        state_patch: Option<Value>,
    ) -> Result<bool> {
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<bool> {
            let conn = Self::open_conn(&db_path, durability)?;
            let now = chrono::Utc::now().timestamp();

            with_immediate_tx(&conn, |conn| {
                let finished_at = status.is_terminal().then_some(now);
                let changed = conn
                    .execute(
                        &format!(
                            r"
                            UPDATE flow_runs
                            SET status = ?1,
                                finished_at = ?2,
                                started_at = CASE
                                    WHEN ?1 = 'running' AND started_at IS NULL THEN ?3
                                    ELSE started_at
                                END
                            WHERE run_id = ?4 AND status NOT IN {TERMINAL_STATUSES}
                            "
                        ),
                        params![status.as_str(), finished_at, now, &run_id],
                    )
                    .context("Failed to update run status")?;

                // State stays frozen once a run is terminal; the patch
                // only lands when the transition itself was accepted.
                if changed > 0 {
                    if let Some(patch) = &state_patch {
                        merge_run_state(conn, &run_id, patch)?;
                    }
                }

                Ok(changed > 0)
            })
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Record the step the worker is currently executing.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn set_current_step(&self, run_id: &str, step: &str) -> Result<()> {
        let run_id = run_id.to_string();
        let step = step.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<()> {
            let conn = Self::open_conn(&db_path, durability)?;
            conn.execute(
                "UPDATE flow_runs SET current_step = ?1 WHERE run_id = ?2",
                params![&step, &run_id],
            )
            .context("Failed to update current step")?;
            Ok(())
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Record a run error message.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn set_error(&self, run_id: &str, error: &str) -> Result<()> {
        let run_id = run_id.to_string();
        let error = error.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<()> {
            let conn = Self::open_conn(&db_path, durability)?;
            conn.execute(
                "UPDATE flow_runs SET error = ?1 WHERE run_id = ?2",
                params![&error, &run_id],
            )
            .context("Failed to update run error")?;
            Ok(())
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Set or clear the cooperative stop flag.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn set_stop_requested(&self, run_id: &str, requested: bool) -> Result<()> {
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<()> {
            let conn = Self::open_conn(&db_path, durability)?;
            conn.execute(
                "UPDATE flow_runs SET stop_requested = ?1 WHERE run_id = ?2",
                params![i64::from(requested), &run_id],
            )
            .context("Failed to update stop_requested")?;
            Ok(())
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Get a run by id.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn get_flow_run(&self, run_id: &str) -> Result<Option<FlowRun>> {
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<Option<FlowRun>> {
            let conn = Self::open_conn(&db_path, durability)?;
            query_run(&conn, &run_id)
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// List runs in creation order, optionally filtered by type and status.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn list_flow_runs(
        &self,
        flow_type: Option<&str>,
        status: Option<RunStatus>,
    ) -> Result<Vec<FlowRun>> {
        let flow_type = flow_type.map(ToString::to_string);
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<Vec<FlowRun>> {
            let conn = Self::open_conn(&db_path, durability)?;

            let mut query = format!("SELECT {RUN_COLUMNS} FROM flow_runs WHERE 1 = 1");
            if flow_type.is_some() {
                query.push_str(" AND flow_type = :flow_type");
            }
            if status.is_some() {
                query.push_str(" AND status = :status");
            }
            // rowid breaks created_at ties in insertion order; run ids are
            // random and would not.
            query.push_str(" ORDER BY created_at ASC, rowid ASC");

            let mut stmt = conn.prepare(&query)?;
            let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
            let status_str = status.map(|s| s.as_str().to_string());
            if let Some(ref ft) = flow_type {
                named.push((":flow_type", ft));
            }
            if let Some(ref st) = status_str {
                named.push((":status", st));
            }

            let runs = stmt
                .query_map(named.as_slice(), row_to_run)?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to list runs")?;

            Ok(runs)
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// All PAUSED runs of `flow_type` except `exclude_run_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn list_paused_runs_for_supersession(
        &self,
        flow_type: &str,
        exclude_run_id: &str,
    ) -> Result<Vec<FlowRun>> {
        let flow_type = flow_type.to_string();
        let exclude = exclude_run_id.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<Vec<FlowRun>> {
            let conn = Self::open_conn(&db_path, durability)?;
            let mut stmt = conn.prepare(&format!(
                r"
                SELECT {RUN_COLUMNS} FROM flow_runs
                WHERE flow_type = ?1 AND status = 'paused' AND run_id != ?2
                ORDER BY created_at ASC, rowid ASC
                "
            ))?;

            let runs = stmt
                .query_map(params![&flow_type, &exclude], row_to_run)?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to list paused runs")?;

            Ok(runs)
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Retire a PAUSED run in favor of `superseded_by`.
    ///
    /// Only affects a run currently in PAUSED status; any other status
    /// (including RUNNING) returns `None` untouched, protecting in-flight
    /// runs from being silently retired.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn mark_run_superseded(
        &self,
        run_id: &str,
        superseded_by: &str,
    ) -> Result<Option<FlowRun>> {
        let run_id = run_id.to_string();
        let superseded_by = superseded_by.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<Option<FlowRun>> {
            let conn = Self::open_conn(&db_path, durability)?;
            let now = chrono::Utc::now().timestamp();

            with_immediate_tx(&conn, |conn| {
                if !mark_superseded_in_tx(conn, &run_id, &superseded_by, now)? {
                    return Ok(None);
                }
                query_run(conn, &run_id)
            })
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Atomic start-flow admission.
    ///
    /// Inside one transaction: reuse an existing PENDING/RUNNING sibling
    /// (unless `metadata.force_new`), or create the run, retire all PAUSED
    /// siblings of the same type, and transition the new run to RUNNING.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn admit_flow_run(
        &self,
        run_id: &str,
        flow_type: &str,
        input: Value,
        metadata: Option<Value>,
    ) -> Result<Admission> {
        let run_id = run_id.to_string();
        let flow_type = flow_type.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<Admission> {
            let conn = Self::open_conn(&db_path, durability)?;
            let now = chrono::Utc::now().timestamp();

            let force_new = metadata
                .as_ref()
                .and_then(|m| m.get("force_new"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

            with_immediate_tx(&conn, |conn| {
                if !force_new {
                    let existing: Option<FlowRun> = conn
                        .query_row(
                            &format!(
                                r"
                                SELECT {RUN_COLUMNS} FROM flow_runs
                                WHERE flow_type = ?1 AND status IN ('pending', 'running')
                                ORDER BY created_at ASC, rowid ASC LIMIT 1
                                "
                            ),
                            params![&flow_type],
                            row_to_run,
                        )
                        .optional()
                        .context("Failed to check for an active sibling")?;

                    if let Some(run) = existing {
                        return Ok(Admission {
                            run,
                            reused: true,
                            superseded: Vec::new(),
                        });
                    }
                }

                insert_run(conn, &run_id, &flow_type, &input, metadata.as_ref(), None, None, now)?;

                let mut stmt = conn.prepare(
                    r"
                    SELECT run_id FROM flow_runs
                    WHERE flow_type = ?1 AND status = 'paused' AND run_id != ?2
                    ",
                )?;
                let paused: Vec<String> = stmt
                    .query_map(params![&flow_type, &run_id], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                drop(stmt);

                let mut superseded = Vec::new();
                for sibling in paused {
                    if mark_superseded_in_tx(conn, &sibling, &run_id, now)? {
                        superseded.push(sibling);
                    }
                }

                conn.execute(
                    r"
                    UPDATE flow_runs SET status = 'running', started_at = ?1
                    WHERE run_id = ?2
                    ",
                    params![now, &run_id],
                )
                .context("Failed to transition admitted run to running")?;

                let run = query_run(conn, &run_id)?.context("Admitted run vanished")?;
                Ok(Admission {
                    run,
                    reused: false,
                    superseded,
                })
            })
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Atomic resume admission.
    ///
    /// Inside one transaction: reject SUPERSEDED and non-resumable runs,
    /// reject when a different run of the same type is RUNNING (unless
    /// `force`), otherwise transition PAUSED/STOPPED back to RUNNING and
    /// clear the cooperative stop flag.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn admit_resume(&self, run_id: &str, force: bool) -> Result<ResumeAdmission> {
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<ResumeAdmission> {
            let conn = Self::open_conn(&db_path, durability)?;
            let now = chrono::Utc::now().timestamp();

            with_immediate_tx(&conn, |conn| {
                let Some(run) = query_run(conn, &run_id)? else {
                    return Ok(ResumeAdmission::NotFound);
                };

                match run.status {
                    RunStatus::Superseded => {
                        return Ok(ResumeAdmission::Superseded {
                            superseded_by: run
                                .superseded_by()
                                .unwrap_or("unknown")
                                .to_string(),
                        });
                    }
                    RunStatus::Paused | RunStatus::Stopped => {}
                    status => return Ok(ResumeAdmission::NotResumable { status }),
                }

                if !force {
                    let active: Option<String> = conn
                        .query_row(
                            r"
                            SELECT run_id FROM flow_runs
                            WHERE flow_type = ?1 AND status = 'running' AND run_id != ?2
                            LIMIT 1
                            ",
                            params![&run.flow_type, &run_id],
                            |row| row.get(0),
                        )
                        .optional()
                        .context("Failed to check for an active sibling")?;

                    if let Some(active_run_id) = active {
                        return Ok(ResumeAdmission::AlreadyActive { active_run_id });
                    }
                }

                conn.execute(
                    r"
                    UPDATE flow_runs
                    SET status = 'running',
                        stop_requested = 0,
                        finished_at = NULL,
                        started_at = COALESCE(started_at, ?1)
                    WHERE run_id = ?2
                    ",
                    params![now, &run_id],
                )
                .context("Failed to transition resumed run to running")?;

                let run = query_run(conn, &run_id)?.context("Resumed run vanished")?;
                Ok(ResumeAdmission::Resumed(run))
            })
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Append an event, allocating the next per-run sequence number.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails after retries.
    pub async fn create_event(
        &self,
        event_id: &str,
        run_id: &str,
        event_type: EventType,
        data: Value,
    ) -> Result<FlowEvent> {
        let event_id = event_id.to_string();
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<FlowEvent> {
            let conn = Self::open_conn(&db_path, durability)?;
            let data_json = serde_json::to_string(&data)?;

            // Retry on UNIQUE(run_id, sequence) races between processes.
            let mut attempts = 0;
            loop {
                attempts += 1;
                let now = chrono::Utc::now().timestamp();

                let result = with_immediate_tx(&conn, |conn| {
                    let next_seq: i64 = conn
                        .query_row(
                            "SELECT COALESCE(MAX(sequence), -1) + 1 FROM flow_events WHERE run_id = ?1",
                            params![&run_id],
                            |row| row.get(0),
                        )
                        .context("Failed to get next sequence number")?;

                    conn.execute(
                        r"
                        INSERT INTO flow_events (event_id, run_id, sequence, event_type, data, created_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                        ",
                        params![&event_id, &run_id, next_seq, event_type.as_str(), &data_json, now],
                    )
                    .context("Failed to insert event")?;

                    Ok((next_seq, now))
                });

                match result {
                    Ok((sequence, created_at)) => {
                        #[allow(clippy::cast_sign_loss, reason = "sequence is non-negative from SQL COALESCE")]
                        return Ok(FlowEvent {
                            event_id,
                            run_id,
                            sequence: sequence as u64,
                            event_type,
                            data,
                            created_at,
                        });
                    }
                    Err(e) if e.to_string().contains("UNIQUE constraint") && attempts < 3 => {
                        std::thread::sleep(std::time::Duration::from_millis(10));
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// All events of a run in insertion order.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn get_events(&self, run_id: &str) -> Result<Vec<FlowEvent>> {
        self.get_events_since(run_id, 0).await
    }

    /// Events of a run with `sequence >= since`, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn get_events_since(&self, run_id: &str, since: u64) -> Result<Vec<FlowEvent>> {
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<Vec<FlowEvent>> {
            let conn = Self::open_conn(&db_path, durability)?;
            let mut stmt = conn.prepare(
                r"
                SELECT event_id, run_id, sequence, event_type, data, created_at
                FROM flow_events
                WHERE run_id = ?1 AND sequence >= ?2
                ORDER BY sequence ASC
                ",
            )?;

            #[allow(clippy::cast_possible_wrap, reason = "sequence numbers stay far below i64::MAX")]
            let since_i64 = since as i64;
            let events = stmt
                .query_map(params![&run_id, since_i64], row_to_event)?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read events")?;

            Ok(events)
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Record an artifact row.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_artifact(
        &self,
        artifact_id: &str,
        run_id: &str,
        kind: &str,
        path: &str,
    ) -> Result<Artifact> {
        let artifact_id = artifact_id.to_string();
        let run_id = run_id.to_string();
        let kind = kind.to_string();
        let path = path.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<Artifact> {
            let conn = Self::open_conn(&db_path, durability)?;
            let now = chrono::Utc::now().timestamp();

            conn.execute(
                r"
                INSERT INTO flow_artifacts (artifact_id, run_id, kind, path, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![&artifact_id, &run_id, &kind, &path, now],
            )
            .context("Failed to insert artifact")?;

            Ok(Artifact {
                artifact_id,
                run_id,
                kind,
                path,
                created_at: now,
            })
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// All artifacts of a run.
    ///
    /// # Errors
    ///
    /// Returns error if the database operation fails.
    pub async fn get_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>> {
        let run_id = run_id.to_string();
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<Vec<Artifact>> {
            let conn = Self::open_conn(&db_path, durability)?;
            let mut stmt = conn.prepare(
                r"
                SELECT artifact_id, run_id, kind, path, created_at
                FROM flow_artifacts
                WHERE run_id = ?1
                ORDER BY created_at ASC, rowid ASC
                ",
            )?;

            let artifacts = stmt
                .query_map(params![&run_id], |row| {
                    Ok(Artifact {
                        artifact_id: row.get(0)?,
                        run_id: row.get(1)?,
                        kind: row.get(2)?,
                        path: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to read artifacts")?;

            Ok(artifacts)
        })
        .await
        .context("Failed to spawn blocking task")?
    }

    /// Run SQLite's quick integrity check.
    ///
    /// # Errors
    ///
    /// Returns error if the check cannot run or reports corruption.
    pub async fn check_integrity(&self) -> Result<()> {
        let db_path = self.db_path.clone();
        let durability = self.durability;

        task::spawn_blocking(move || -> Result<()> {
            let conn = Self::open_conn(&db_path, durability)?;
            let verdict: String = conn
                .query_row("PRAGMA quick_check", [], |row| row.get(0))
                .context("Failed to run integrity check")?;

            if verdict != "ok" {
                anyhow::bail!("Flows database failed integrity check: {verdict}");
            }
            Ok(())
        })
        .await
        .context("Failed to spawn blocking task")?
    }
}

/// True when `err`'s chain contains a structural SQLite corruption code.
#[must_use]
pub fn is_corruption_error(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(rusqlite::Error::SqliteFailure(ffi_err, _)) =
            cause.downcast_ref::<rusqlite::Error>()
        {
            if matches!(
                ffi_err.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ) {
                return true;
            }
        }
    }
    err.to_string().contains("integrity check")
}

const RUN_COLUMNS: &str = "run_id, flow_type, status, current_step, input, state, metadata, \
                           error, stop_requested, created_at, started_at, finished_at";

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowRun> {
    let status_str: String = row.get(2)?;
    let input_json: String = row.get(4)?;
    let state_json: String = row.get(5)?;
    let metadata_json: String = row.get(6)?;
    let stop_requested: i64 = row.get(8)?;

    Ok(FlowRun {
        run_id: row.get(0)?,
        flow_type: row.get(1)?,
        status: RunStatus::from_str(&status_str).unwrap_or(RunStatus::Failed),
        current_step: row.get(3)?,
        input: serde_json::from_str(&input_json).unwrap_or(Value::Null),
        state: serde_json::from_str(&state_json).unwrap_or_else(|_| Value::Object(Default::default())),
        metadata: serde_json::from_str(&metadata_json)
            .unwrap_or_else(|_| Value::Object(Default::default())),
        error: row.get(7)?,
        stop_requested: stop_requested != 0,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        finished_at: row.get(11)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlowEvent> {
    let event_type_str: String = row.get(3)?;
    let data_json: String = row.get(4)?;
    let sequence: i64 = row.get(2)?;

    #[allow(clippy::cast_sign_loss, reason = "sequence is non-negative by construction")]
    Ok(FlowEvent {
        event_id: row.get(0)?,
        run_id: row.get(1)?,
        sequence: sequence as u64,
        event_type: EventType::from_str(&event_type_str).unwrap_or(EventType::StepCompleted),
        data: serde_json::from_str(&data_json).unwrap_or(Value::Null),
        created_at: row.get(5)?,
    })
}

fn query_run(conn: &Connection, run_id: &str) -> Result<Option<FlowRun>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM flow_runs WHERE run_id = ?1"),
        params![run_id],
        row_to_run,
    )
    .optional()
    .context("Failed to query run")
}

#[allow(clippy::too_many_arguments, reason = "Mirrors the flow_runs column list")]
fn insert_run(
    conn: &Connection,
    run_id: &str,
    flow_type: &str,
    input: &Value,
    metadata: Option<&Value>,
    state: Option<&Value>,
    current_step: Option<&str>,
    now: i64,
) -> Result<()> {
    let empty = Value::Object(Default::default());
    let metadata = metadata.unwrap_or(&empty);
    let state = state.unwrap_or(&empty);

    let inserted = conn.execute(
        r"
        INSERT OR IGNORE INTO flow_runs
            (run_id, flow_type, status, current_step, input, state, metadata,
             stop_requested, created_at)
        VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, 0, ?7)
        ",
        params![
            run_id,
            flow_type,
            current_step,
            serde_json::to_string(input)?,
            serde_json::to_string(state)?,
            serde_json::to_string(metadata)?,
            now
        ],
    )?;

    if inserted == 0 {
        anyhow::bail!("Flow run '{run_id}' already exists");
    }
    Ok(())
}

/// Shallow-merge `patch`'s top-level keys into the run's state JSON.
fn merge_run_state(conn: &Connection, run_id: &str, patch: &Value) -> Result<()> {
    let Some(patch_obj) = patch.as_object() else {
        return Ok(());
    };
    if patch_obj.is_empty() {
        return Ok(());
    }

    let current: Option<String> = conn
        .query_row(
            "SELECT state FROM flow_runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(current) = current else {
        return Ok(());
    };

    let mut merged: BTreeMap<String, Value> = serde_json::from_str(&current).unwrap_or_default();
    for (key, value) in patch_obj {
        merged.insert(key.clone(), value.clone());
    }

    conn.execute(
        "UPDATE flow_runs SET state = ?1 WHERE run_id = ?2",
        params![serde_json::to_string(&merged)?, run_id],
    )?;

    Ok(())
}

/// Supersede a PAUSED run in-transaction. Returns false when the run is
/// absent or not paused.
fn mark_superseded_in_tx(
    conn: &Connection,
    run_id: &str,
    superseded_by: &str,
    now: i64,
) -> Result<bool> {
    let current: Option<(String, String)> = conn
        .query_row(
            "SELECT status, metadata FROM flow_runs WHERE run_id = ?1",
            params![run_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((status, metadata_json)) = current else {
        return Ok(false);
    };
    if status != "paused" {
        return Ok(false);
    }

    let mut metadata: serde_json::Map<String, Value> =
        serde_json::from_str(&metadata_json).unwrap_or_default();
    metadata.insert("superseded_by".to_string(), Value::String(superseded_by.to_string()));
    metadata.insert(
        "superseded_at".to_string(),
        Value::String(chrono::Utc::now().to_rfc3339()),
    );

    conn.execute(
        r"
        UPDATE flow_runs
        SET status = 'superseded', finished_at = ?1, metadata = ?2
        WHERE run_id = ?3 AND status = 'paused'
        ",
        params![now, serde_json::to_string(&Value::Object(metadata))?, run_id],
    )?;

    Ok(true)
}

/// Run `body` inside a `BEGIN IMMEDIATE` transaction with rollback on error.
fn with_immediate_tx<T>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute("BEGIN IMMEDIATE", [])
        .context("Failed to begin transaction")?;

    match body(conn) {
        Ok(value) => {
            conn.execute("COMMIT", [])
                .context("Failed to commit transaction")?;
            Ok(value)
        }
        Err(e) => {
            conn.execute("ROLLBACK", []).ok();
            Err(e)
        }
    }
}
