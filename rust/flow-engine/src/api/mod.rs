//! HTTP surface over the flow controller.
//!
//! Thin axum layer: handlers translate between JSON DTOs and
//! [`FlowController`] calls, and [`FlowError`] values map onto status
//! codes (404 unknown run, 409 admission conflicts, 503 store
//! unavailable). The start endpoint is the one place with retry logic: a
//! corrupt store triggers one rotate-and-reinitialize recovery, then the
//! admission is attempted once more before giving up with 503.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::controller::{FlowController, StartOutcome};
use crate::error::FlowError;
use crate::store::{Artifact, FlowEvent, FlowRun, RunStatus};
use crate::store::recovery;

/// Shared state for all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The controller all requests go through.
    pub controller: FlowController,
}

/// Build the engine's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/flows/{flow_type}/start", post(start_flow))
        .route("/runs", get(list_runs))
        .route("/runs/{run_id}", get(get_status))
        .route("/runs/{run_id}/stop", post(stop_flow))
        .route("/runs/{run_id}/resume", post(resume_flow))
        .route("/runs/{run_id}/events", get(get_events))
        .route("/runs/{run_id}/stream", get(stream_events))
        .route("/runs/{run_id}/artifacts", get(get_artifacts))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run representation returned by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
    pub run_id: String,
    pub flow_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub state: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stop_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

impl From<FlowRun> for RunResponse {
    fn from(run: FlowRun) -> Self {
        let superseded_by = run.superseded_by().map(ToString::to_string);
        Self {
            run_id: run.run_id,
            flow_type: run.flow_type,
            status: run.status.to_string(),
            current_step: run.current_step,
            state: run.state,
            error: run.error,
            stop_requested: run.stop_requested,
            superseded_by,
            created_at: run.created_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResponse {
    pub event_id: String,
    pub sequence: u64,
    pub event_type: String,
    pub data: Value,
    pub created_at: i64,
}

impl From<FlowEvent> for EventResponse {
    fn from(event: FlowEvent) -> Self {
        Self {
            event_id: event.event_id,
            sequence: event.sequence,
            event_type: event.event_type.to_string(),
            data: event.data,
            created_at: event.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactResponse {
    pub artifact_id: String,
    pub kind: String,
    pub path: String,
    pub created_at: i64,
}

impl From<Artifact> for ArtifactResponse {
    fn from(artifact: Artifact) -> Self {
        Self {
            artifact_id: artifact.artifact_id,
            kind: artifact.kind,
            path: artifact.path,
            created_at: artifact.created_at,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub run: RunResponse,
    pub reused: bool,
    pub superseded: Vec<String>,
    /// Set to `active_run_reused` when an existing run was returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl From<StartOutcome> for StartResponse {
    fn from(outcome: StartOutcome) -> Self {
        Self {
            run: outcome.run.into(),
            reused: outcome.reused,
            superseded: outcome.superseded,
            hint: outcome.reused.then(|| "active_run_reused".to_string()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub run: RunResponse,
    /// True when a live worker currently holds the run.
    pub lock_held: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub flow_type: Option<String>,
    pub status: Option<RunStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: u64,
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

struct ApiError(FlowError);

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FlowError::InvalidDefinition(_) | FlowError::UnknownFlowType(_) => {
                StatusCode::BAD_REQUEST
            }
            FlowError::RunNotFound(_) => StatusCode::NOT_FOUND,
            FlowError::Superseded { .. }
            | FlowError::AlreadyActive { .. }
            | FlowError::NotResumable { .. } => StatusCode::CONFLICT,
            FlowError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FlowError::WorkerLaunch { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            FlowError::Other(_) => {
                if self.0.is_corruption() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        };

        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn start_flow(
    State(state): State<AppState>,
    Path(flow_type): Path<String>,
    Json(request): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    let first = state
        .controller
        .start_flow(&flow_type, request.input.clone(), request.metadata.clone())
        .await;

    let outcome = match first {
        Ok(outcome) => outcome,
        Err(e) if e.is_corruption() => {
            // One recovery, one retry. A second failure surfaces as 503.
            recovery::recover_store(state.controller.paths(), &e.to_string())
                .await
                .map_err(|recover_err| {
                    FlowError::StoreUnavailable(recover_err.to_string())
                })?;
            state
                .controller
                .start_flow(&flow_type, request.input, request.metadata)
                .await
                .map_err(|retry_err| FlowError::StoreUnavailable(retry_err.to_string()))?
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Json(outcome.into()))
}

async fn stop_flow(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let run = state.controller.stop_flow(&run_id).await?;
    Ok(Json(run.into()))
}

async fn resume_flow(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    request: Option<Json<ResumeRequest>>,
) -> Result<Json<RunResponse>, ApiError> {
    let force = request.map(|Json(r)| r.force).unwrap_or_default();
    let run = state.controller.resume_flow(&run_id, force).await?;
    Ok(Json(run.into()))
}

async fn get_status(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let reconciliation = state.controller.get_status(&run_id).await?;
    Ok(Json(StatusResponse {
        run: reconciliation.run.into(),
        lock_held: reconciliation.lock_held,
    }))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RunResponse>>, ApiError> {
    let runs = state
        .controller
        .list_runs(query.flow_type.as_deref(), query.status)
        .await?;
    Ok(Json(runs.into_iter().map(Into::into).collect()))
}

async fn get_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<EventResponse>>, ApiError> {
    if state.controller.store().get_flow_run(&run_id).await.map_err(FlowError::Other)?.is_none() {
        return Err(FlowError::RunNotFound(run_id).into());
    }
    let events = state
        .controller
        .store()
        .get_events_since(&run_id, query.since)
        .await
        .map_err(FlowError::Other)?;
    Ok(Json(events.into_iter().map(Into::into).collect()))
}

async fn stream_events(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    if state.controller.store().get_flow_run(&run_id).await.map_err(FlowError::Other)?.is_none() {
        return Err(FlowError::RunNotFound(run_id).into());
    }

    let stream = state
        .controller
        .stream_events(run_id, query.since)
        .map(|item| {
            let event = match item {
                Ok(flow_event) => {
                    let response: EventResponse = flow_event.into();
                    Event::default()
                        .event(response.event_type.clone())
                        .json_data(&response)
                        .unwrap_or_else(|_| Event::default().data("serialization failed"))
                }
                Err(e) => Event::default()
                    .event("error")
                    .data(json!({ "error": e.to_string() }).to_string()),
            };
            Ok(event)
        });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn get_artifacts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Vec<ArtifactResponse>>, ApiError> {
    if state.controller.store().get_flow_run(&run_id).await.map_err(FlowError::Other)?.is_none() {
        return Err(FlowError::RunNotFound(run_id).into());
    }
    let artifacts = state.controller.get_artifacts(&run_id).await?;
    Ok(Json(artifacts.into_iter().map(Into::into).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::definition::{FlowDefinition, FlowRegistry, StepOutcome};
    use crate::store::FlowStore;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn pausing_registry() -> FlowRegistry {
        let def = FlowDefinition::new("review", "wait")
            .step("wait", ["finish"], |run, _input| async move {
                if run.state["approved"].as_bool().unwrap_or(false) {
                    StepOutcome::continue_to(["finish"], json!({}))
                } else {
                    StepOutcome::pause(json!({}))
                }
            })
            .step("finish", Vec::<String>::new(), |_run, _input| async {
                StepOutcome::complete(json!({}))
            });
        let mut registry = FlowRegistry::new();
        registry.register(def).unwrap();
        registry
    }

    async fn test_app() -> (Router, FlowController, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            state_root: dir.path().to_path_buf(),
            poll_interval_ms: 10,
            ..EngineConfig::default()
        };
        let store = FlowStore::new(config.paths().db_path()).await.unwrap();
        let controller = FlowController::embedded(store, pausing_registry(), config);
        let app = router(AppState {
            controller: controller.clone(),
        });
        (app, controller, dir)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn wait_for_paused(controller: &FlowController, run_id: &str) {
        for _ in 0..200 {
            let run = controller
                .store()
                .get_flow_run(run_id)
                .await
                .unwrap()
                .unwrap();
            if run.status == RunStatus::Paused {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("run never paused");
    }

    #[tokio::test]
    async fn test_start_and_status() {
        let (app, controller, _dir) = test_app().await;

        let response = app
            .clone()
            .oneshot(post_json("/flows/review/start", json!({"input": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["reused"], false);
        let run_id = body["run"]["run_id"].as_str().unwrap().to_string();
        wait_for_paused(&controller, &run_id).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{run_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "paused");
        assert_eq!(body["lock_held"], false);
    }

    #[tokio::test]
    async fn test_start_unknown_type_is_400() {
        let (app, _controller, _dir) = test_app().await;

        let response = app
            .oneshot(post_json("/flows/ghost/start", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_second_start_hints_reuse() {
        let (app, _controller, _dir) = test_app().await;

        let first = app
            .clone()
            .oneshot(post_json("/flows/review/start", json!({})))
            .await
            .unwrap();
        let first = body_json(first).await;

        // Immediately start again; if the first run is still active the
        // response carries the reuse hint.
        let second = app
            .oneshot(post_json("/flows/review/start", json!({})))
            .await
            .unwrap();
        let second = body_json(second).await;

        if second["reused"] == true {
            assert_eq!(second["hint"], "active_run_reused");
            assert_eq!(second["run"]["run_id"], first["run"]["run_id"]);
        } else {
            assert!(second.get("hint").is_none());
        }
    }

    #[tokio::test]
    async fn test_status_of_missing_run_is_404() {
        let (app, _controller, _dir) = test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/runs/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resume_superseded_is_409() {
        let (app, controller, _dir) = test_app().await;

        let first = body_json(
            app.clone()
                .oneshot(post_json("/flows/review/start", json!({})))
                .await
                .unwrap(),
        )
        .await;
        let first_id = first["run"]["run_id"].as_str().unwrap().to_string();
        wait_for_paused(&controller, &first_id).await;

        let second = body_json(
            app.clone()
                .oneshot(post_json("/flows/review/start", json!({})))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(second["superseded"][0], first_id.as_str());

        let response = app
            .oneshot(post_json(&format!("/runs/{first_id}/resume"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("superseded"));
    }

    #[tokio::test]
    async fn test_stop_and_list_filters() {
        let (app, controller, _dir) = test_app().await;

        let start = body_json(
            app.clone()
                .oneshot(post_json("/flows/review/start", json!({})))
                .await
                .unwrap(),
        )
        .await;
        let run_id = start["run"]["run_id"].as_str().unwrap().to_string();
        wait_for_paused(&controller, &run_id).await;

        let response = app
            .clone()
            .oneshot(post_json(&format!("/runs/{run_id}/stop"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "stopped");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/runs?status=stopped")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["run_id"], run_id.as_str());
    }

    #[tokio::test]
    async fn test_events_endpoint_with_cursor() {
        let (app, controller, _dir) = test_app().await;

        let start = body_json(
            app.clone()
                .oneshot(post_json("/flows/review/start", json!({})))
                .await
                .unwrap(),
        )
        .await;
        let run_id = start["run"]["run_id"].as_str().unwrap().to_string();
        wait_for_paused(&controller, &run_id).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{run_id}/events"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        let events = body.as_array().unwrap();
        assert!(!events.is_empty());
        assert_eq!(events[0]["event_type"], "flow_started");
        assert_eq!(events[0]["sequence"], 0);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{run_id}/events?since=1"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body
            .as_array()
            .unwrap()
            .iter()
            .all(|e| e["sequence"].as_u64().unwrap() >= 1));
    }

    #[tokio::test]
    async fn test_artifacts_endpoint() {
        let (app, controller, _dir) = test_app().await;

        let start = body_json(
            app.clone()
                .oneshot(post_json("/flows/review/start", json!({})))
                .await
                .unwrap(),
        )
        .await;
        let run_id = start["run"]["run_id"].as_str().unwrap().to_string();
        wait_for_paused(&controller, &run_id).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{run_id}/artifacts"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        let artifacts = body.as_array().unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0]["kind"], "pause_dispatch");
    }

    #[tokio::test]
    async fn test_start_recovers_from_corrupt_store() {
        let (app, controller, _dir) = test_app().await;

        // Clobber the database after the engine opened it. The store
        // opens a fresh connection per operation, so the next admission
        // hits the corruption.
        let db_path = controller.paths().db_path();
        std::fs::write(&db_path, b"this is not sqlite at all").unwrap();

        let response = app
            .clone()
            .oneshot(post_json("/flows/review/start", json!({})))
            .await
            .unwrap();
        // One recovery plus one retry turns the corruption into a
        // successful start on a fresh store.
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["reused"], false);

        // The damaged file was rotated aside with a notice.
        let notice = recovery::read_notice(controller.paths()).unwrap().unwrap();
        assert_eq!(notice.status, "corrupt");
        assert!(notice.backup_path.exists());
    }
}
