//! Durable flow orchestration engine.
//!
//! Flows are multi-step, long-lived processes that survive process
//! crashes and machine restarts. All durable state lives in a SQLite run
//! store (runs, an append-only event log, artifacts); step execution
//! happens in out-of-process workers that the engine spawns, watches, and
//! reconciles against recorded state.
//!
//! # Architecture
//!
//! - [`store`] - SQLite persistence: runs, events, artifacts, atomic
//!   admission, corruption recovery
//! - [`definition`] - the step contract: flow definitions, step
//!   functions, eager validation
//! - [`controller`] - start/stop/resume/status/stream, behind the
//!   [`controller::WorkerLauncher`] seam
//! - [`worker`] - worker records, liveness checks, crash reports, and
//!   the worker-side step loop
//! - [`reconciler`] - repairs runs whose worker died mid-flight
//! - [`dispatch`] - operator-facing pause/crash notices
//! - [`api`] - axum HTTP surface
//!
//! # Quick start (embedded)
//!
//! ```rust,no_run
//! use flow_engine::config::EngineConfig;
//! use flow_engine::controller::FlowController;
//! use flow_engine::definition::{FlowDefinition, FlowRegistry, StepOutcome};
//! use flow_engine::store::FlowStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load()?;
//!     let store = FlowStore::new(config.paths().db_path()).await?;
//!
//!     let mut registry = FlowRegistry::new();
//!     registry.register(
//!         FlowDefinition::new("greeter", "greet").step(
//!             "greet",
//!             Vec::<String>::new(),
//!             |_run, input| async move {
//!                 StepOutcome::complete(serde_json::json!({
//!                     "greeting": format!("hello, {}", input["name"])
//!                 }))
//!             },
//!         ),
//!     )?;
//!
//!     let controller = FlowController::embedded(store, registry, config);
//!     let outcome = controller
//!         .start_flow("greeter", serde_json::json!({"name": "ada"}), None)
//!         .await?;
//!     println!("started run {}", outcome.run.run_id);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod controller;
pub mod definition;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod reconciler;
pub mod store;
pub mod worker;

pub use config::{EngineConfig, StatePaths};
pub use controller::{
    EmbeddedLauncher, FlowController, ProcessWorkerLauncher, StartOutcome, WorkerLauncher,
};
pub use definition::{FlowDefinition, FlowRegistry, StepOutcome};
pub use error::{FlowError, FlowResult};
pub use store::{Artifact, EventType, FlowEvent, FlowRun, FlowStore, RunStatus};
