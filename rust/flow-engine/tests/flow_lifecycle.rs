//! End-to-end lifecycle tests through the public API: start, pause,
//! resume, stop, supersession, crash repair, and event streaming.

use flow_engine::config::EngineConfig;
use flow_engine::controller::FlowController;
use flow_engine::definition::{FlowDefinition, FlowRegistry, StepOutcome};
use flow_engine::error::FlowError;
use flow_engine::reconciler;
use flow_engine::store::{EventType, FlowRun, FlowStore, RunStatus};
use flow_engine::worker::WorkerRecord;
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;

/// increment -> check -> (increment | done): counts input value up to 3.
fn counter_flow() -> FlowDefinition {
    FlowDefinition::new("counter", "increment")
        .step("increment", ["check"], |run, input| async move {
            let current = run.state["value"]
                .as_i64()
                .unwrap_or_else(|| input["value"].as_i64().unwrap_or(0));
            StepOutcome::continue_to(["check"], json!({ "value": current + 1 }))
        })
        .step("check", ["increment", "done"], |run, _input| async move {
            if run.state["value"].as_i64().unwrap_or(0) >= 3 {
                StepOutcome::continue_to(["done"], json!({}))
            } else {
                StepOutcome::continue_to(["increment"], json!({}))
            }
        })
        .step("done", Vec::<String>::new(), |_run, _input| async {
            StepOutcome::complete(json!({ "counted": true }))
        })
}

/// gather -> approval (pauses until `approved`) -> publish.
fn approval_flow() -> FlowDefinition {
    FlowDefinition::new("release", "gather")
        .step("gather", ["approval"], |_run, _input| async {
            StepOutcome::continue_to(["approval"], json!({ "gathered": true }))
        })
        .step("approval", ["publish"], |run, _input| async move {
            if run.state["approved"].as_bool().unwrap_or(false) {
                StepOutcome::continue_to(["publish"], json!({}))
            } else {
                StepOutcome::pause(json!({ "awaiting": "approval" }))
            }
        })
        .step("publish", Vec::<String>::new(), |_run, _input| async {
            StepOutcome::complete(json!({ "published": true }))
        })
}

fn registry() -> FlowRegistry {
    let mut registry = FlowRegistry::new();
    registry.register(counter_flow()).unwrap();
    registry.register(approval_flow()).unwrap();
    registry
}

async fn engine() -> (FlowController, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        state_root: dir.path().to_path_buf(),
        poll_interval_ms: 10,
        stop_grace_ms: 200,
        ..EngineConfig::default()
    };
    let store = FlowStore::new(config.paths().db_path()).await.unwrap();
    let controller = FlowController::embedded(store, registry(), config);
    (controller, dir)
}

async fn wait_for(controller: &FlowController, run_id: &str, status: RunStatus) -> FlowRun {
    for _ in 0..300 {
        let run = controller
            .store()
            .get_flow_run(run_id)
            .await
            .unwrap()
            .unwrap();
        if run.status == status {
            return run;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("run {run_id} never reached {status}");
}

#[tokio::test]
async fn counter_flow_runs_to_completion() {
    let (controller, _dir) = engine().await;

    let outcome = controller
        .start_flow("counter", json!({ "value": 0 }), None)
        .await
        .unwrap();
    let run = wait_for(&controller, &outcome.run.run_id, RunStatus::Completed).await;

    assert_eq!(run.state["value"], 3);
    assert_eq!(run.state["counted"], true);
    assert!(run.finished_at.is_some());
    assert!(run.error.is_none());

    let events = controller
        .store()
        .get_events(&run.run_id)
        .await
        .unwrap();
    assert_eq!(events.first().unwrap().event_type, EventType::FlowStarted);
    assert_eq!(events.last().unwrap().event_type, EventType::FlowCompleted);

    // Sequences are gapless from zero, and exactly one terminal event.
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, i as u64);
    }
    assert_eq!(
        events.iter().filter(|e| e.event_type.is_terminal()).count(),
        1
    );
}

#[tokio::test]
async fn pause_resume_completes_run() {
    let (controller, _dir) = engine().await;

    let outcome = controller
        .start_flow("release", json!({}), None)
        .await
        .unwrap();
    let run_id = outcome.run.run_id.clone();
    let run = wait_for(&controller, &run_id, RunStatus::Paused).await;
    assert_eq!(run.state["awaiting"], "approval");
    assert_eq!(run.current_step.as_deref(), Some("approval"));

    // The pause left a dispatch notice on disk.
    let artifacts = controller.get_artifacts(&run_id).await.unwrap();
    assert_eq!(artifacts[0].kind, "pause_dispatch");
    let notice = std::fs::read_to_string(&artifacts[0].path).unwrap();
    assert!(notice.contains("mode: pause"));

    // Approve and resume; the run picks up at the paused step.
    controller
        .store()
        .update_flow_run_status(&run_id, RunStatus::Paused, Some(json!({ "approved": true })))
        .await
        .unwrap();
    controller.resume_flow(&run_id, false).await.unwrap();

    let run = wait_for(&controller, &run_id, RunStatus::Completed).await;
    assert_eq!(run.state["published"], true);

    // flow_started appears exactly once across the pause boundary.
    let events = controller.store().get_events(&run_id).await.unwrap();
    let starts = events
        .iter()
        .filter(|e| e.event_type == EventType::FlowStarted)
        .count();
    assert_eq!(starts, 1);
}

#[tokio::test]
async fn new_run_supersedes_paused_and_blocks_resume() {
    let (controller, _dir) = engine().await;

    let first = controller
        .start_flow("release", json!({}), None)
        .await
        .unwrap();
    wait_for(&controller, &first.run.run_id, RunStatus::Paused).await;

    let second = controller
        .start_flow("release", json!({}), None)
        .await
        .unwrap();
    assert!(!second.reused);
    assert_eq!(second.superseded, vec![first.run.run_id.clone()]);

    let old = controller
        .store()
        .get_flow_run(&first.run.run_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.status, RunStatus::Superseded);
    assert_eq!(old.superseded_by(), Some(second.run.run_id.as_str()));
    assert!(old.finished_at.is_some());

    let err = controller
        .resume_flow(&first.run.run_id, false)
        .await
        .unwrap_err();
    match err {
        FlowError::Superseded { superseded_by, .. } => {
            assert_eq!(superseded_by, second.run.run_id);
        }
        other => panic!("expected Superseded, got {other}"),
    }
}

#[tokio::test]
async fn concurrent_starts_admit_exactly_one_active_run() {
    let (controller, _dir) = engine().await;

    let mut handles = Vec::new();
    for _ in 0..5 {
        let controller = controller.clone();
        handles.push(tokio::spawn(async move {
            controller.start_flow("release", json!({}), None).await
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    // All five callers were answered with the same run (one creator, the
    // rest reused), unless the run raced all the way to PAUSED between
    // admissions, in which case later starts superseded it. Either way:
    // never two active runs at once.
    let active = controller
        .list_runs(Some("release"), Some(RunStatus::Running))
        .await
        .unwrap();
    let pending = controller
        .list_runs(Some("release"), Some(RunStatus::Pending))
        .await
        .unwrap();
    assert!(active.len() + pending.len() <= 1);

    let created: Vec<_> = outcomes.iter().filter(|o| !o.reused).collect();
    assert!(!created.is_empty());
}

#[tokio::test]
async fn stop_then_resume_revives_run() {
    let (controller, _dir) = engine().await;

    let outcome = controller
        .start_flow("release", json!({}), None)
        .await
        .unwrap();
    let run_id = outcome.run.run_id.clone();
    wait_for(&controller, &run_id, RunStatus::Paused).await;

    let stopped = controller.stop_flow(&run_id).await.unwrap();
    assert_eq!(stopped.status, RunStatus::Stopped);
    assert!(stopped.finished_at.is_some());

    let resumed = controller.resume_flow(&run_id, false).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Running);
    assert!(resumed.finished_at.is_none());
    assert!(!resumed.stop_requested);

    // Without approval it parks paused again, still resumable.
    wait_for(&controller, &run_id, RunStatus::Paused).await;
}

#[tokio::test]
async fn dead_worker_is_reconciled_to_paused_with_crash_report() {
    let (controller, _dir) = engine().await;

    // Fabricate a run that claims to be RUNNING under a worker that no
    // longer exists.
    controller
        .store()
        .create_flow_run("ghost-run", "release", json!({}), None, None, None)
        .await
        .unwrap();
    controller
        .store()
        .update_flow_run_status("ghost-run", RunStatus::Running, None)
        .await
        .unwrap();
    WorkerRecord {
        run_id: "ghost-run".to_string(),
        pid: 999_999_999,
        cmd: vec!["flow-worker".to_string()],
        repo_root: ".".to_string(),
        started_at: chrono::Utc::now().to_rfc3339(),
    }
    .write(&controller.paths().worker_record_path("ghost-run"))
    .unwrap();

    let status = controller.get_status("ghost-run").await.unwrap();
    assert!(status.state_changed);
    assert!(!status.lock_held);
    assert_eq!(status.run.status, RunStatus::Paused);

    // Crash report persisted outside the store, dispatch notice recorded.
    let report_path = controller.paths().crash_report_path("ghost-run");
    assert!(report_path.exists());
    let artifacts = controller.get_artifacts("ghost-run").await.unwrap();
    assert!(artifacts.iter().any(|a| a.kind == "worker_crash"));

    // The parked run resumes normally afterwards.
    controller.resume_flow("ghost-run", false).await.unwrap();
    wait_for(&controller, "ghost-run", RunStatus::Paused).await;
}

#[tokio::test]
async fn startup_sweep_parks_orphaned_runs() {
    let (controller, _dir) = engine().await;

    controller
        .store()
        .create_flow_run("orphan", "counter", json!({}), None, None, None)
        .await
        .unwrap();
    controller
        .store()
        .update_flow_run_status("orphan", RunStatus::Running, None)
        .await
        .unwrap();

    let results = reconciler::reconcile_active(controller.store(), controller.paths())
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].state_changed);
    assert_eq!(results[0].run.status, RunStatus::Paused);
}

#[tokio::test]
async fn stream_replays_history_then_follows_live_tail() {
    let (controller, _dir) = engine().await;

    let outcome = controller
        .start_flow("counter", json!({ "value": 0 }), None)
        .await
        .unwrap();
    let run_id = outcome.run.run_id.clone();

    // Collect the stream concurrently with the worker producing events.
    let events: Vec<_> = controller
        .stream_events(run_id.clone(), 0)
        .map(Result::unwrap)
        .collect()
        .await;

    assert_eq!(events.first().unwrap().event_type, EventType::FlowStarted);
    assert_eq!(events.last().unwrap().event_type, EventType::FlowCompleted);
    for pair in events.windows(2) {
        assert_eq!(pair[1].sequence, pair[0].sequence + 1);
    }
}

#[tokio::test]
async fn force_new_runs_complete_independently() {
    let (controller, _dir) = engine().await;

    let first = controller
        .start_flow("counter", json!({ "value": 0 }), None)
        .await
        .unwrap();
    let second = controller
        .start_flow(
            "counter",
            json!({ "value": 10 }),
            Some(json!({ "force_new": true })),
        )
        .await
        .unwrap();

    assert!(!second.reused);
    assert_ne!(second.run.run_id, first.run.run_id);

    // Both runs finish with their own state, untouched by the sibling.
    let first = wait_for(&controller, &first.run.run_id, RunStatus::Completed).await;
    let second = wait_for(&controller, &second.run.run_id, RunStatus::Completed).await;
    assert_eq!(first.state["value"], 3);
    assert_eq!(second.state["value"], 11);

    // Each event log is complete and private to its run.
    let store = controller.store();
    let first_events = store.get_events(&first.run_id).await.unwrap();
    let second_events = store.get_events(&second.run_id).await.unwrap();
    for events in [&first_events, &second_events] {
        assert_eq!(events.first().unwrap().event_type, EventType::FlowStarted);
        assert_eq!(events.last().unwrap().event_type, EventType::FlowCompleted);
    }
    let first_ids: std::collections::HashSet<&str> =
        first_events.iter().map(|e| e.event_id.as_str()).collect();
    assert!(
        second_events
            .iter()
            .all(|e| !first_ids.contains(e.event_id.as_str()))
    );
}
