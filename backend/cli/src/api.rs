use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use uuid::Uuid;

use deepeyes_core::ScanResult;
use deepeyes_ingest::UploadEvent;
use deepeyes_runtime::StartOutcome;

use crate::services::Services;

const DEFAULT_INSTANCE_LIMIT: usize = 50;
const MAX_INSTANCE_LIMIT: usize = 500;

/// Shared application state for API handlers.
pub struct AppState {
    pub services: Services,
}

/// Build the Axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/results", get(list_results))
        .route("/api/results/:id", get(get_result))
        .route("/api/health", get(health))
        .route("/api/instances", get(list_instances))
        .route("/api/instances/:id", get(get_instance))
        .route("/api/instances/:id/cancel", post(cancel_instance))
        .route("/api/ingest", post(ingest))
        .route("/api/ws", get(ws_handler))
        .with_state(state)
}

/// WebSocket handler streaming live runtime events.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut stream = BroadcastStream::new(state.services.orchestrator.subscribe());

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(event)) => {
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "WebSocket client lagged, events dropped");
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "deepeyes",
        "version": env!("CARGO_PKG_VERSION"),
        "owner": state.services.orchestrator.owner_id(),
    }))
}

/// Current ScanResult snapshots, newest first.
async fn list_results(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ScanResult>>, StatusCode> {
    state.services.results.list().await.map(Json).map_err(|e| {
        tracing::error!(error = %e, "Failed to list results");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScanResult>, StatusCode> {
    state
        .services
        .results
        .get(&id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, result_id = %id, "Failed to fetch result");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, StatusCode> {
    let limit = params.limit.unwrap_or(DEFAULT_INSTANCE_LIMIT).clamp(1, MAX_INSTANCE_LIMIT);
    match state.services.orchestrator.list(limit).await {
        Ok(instances) => Ok(Json(json!({ "instances": instances }))),
        Err(e) => {
            tracing::error!(error = %e, "Failed to list instances");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Instance status plus its recorded event trail.
async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    let instance = state
        .services
        .orchestrator
        .status(id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, instance_id = %id, "Failed to fetch instance");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let events = state.services.events.get_instance_events(&id).await.map_err(|e| {
        tracing::error!(error = %e, instance_id = %id, "Failed to fetch instance events");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({
        "instance": instance,
        "running": state.services.orchestrator.is_running(id).await,
        "events": events,
    })))
}

async fn cancel_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    let orchestrator = &state.services.orchestrator;
    let accepted = orchestrator.cancel(id).await.map_err(|e| {
        tracing::error!(error = %e, instance_id = %id, "Failed to request cancellation");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if accepted {
        return Ok(Json(json!({ "status": "cancellation_requested", "instanceId": id })));
    }
    // Unknown ids are 404; terminal ones can no longer be cancelled.
    match orchestrator.status(id).await {
        Ok(Some(_)) => Err(StatusCode::CONFLICT),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(error = %e, instance_id = %id, "Failed to fetch instance");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestRequest {
    url: String,
    name: Option<String>,
    event_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    instance_id: Uuid,
    #[serde(flatten)]
    outcome: StartOutcome,
}

/// Announce an uploaded image by URL. Redelivery of the same event is a no-op.
async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), StatusCode> {
    let valid = reqwest::Url::parse(&request.url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !valid {
        tracing::warn!(url = %request.url, "Rejected ingest request with invalid URL");
        return Err(StatusCode::BAD_REQUEST);
    }

    let event = UploadEvent::from_url(
        &request.url,
        request.name.as_deref(),
        request.event_id.as_deref(),
    );
    let submission = state.services.trigger.submit(event).await.map_err(|e| {
        tracing::error!(error = %e, url = %request.url, "Failed to start analysis");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let code = if submission.is_new() { StatusCode::ACCEPTED } else { StatusCode::OK };
    Ok((
        code,
        Json(IngestResponse {
            instance_id: submission.instance_id,
            outcome: submission.outcome,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use deepeyes_config::DeepEyesConfig;
    use deepeyes_core::{
        DeepEyesError, DescriptionResult, ImageRef, InstanceStatus, JobId, JobStatus, ResultStore,
        Tag, VisionAdapter,
    };
    use deepeyes_store::{EventStore, SqliteCheckpointStore, SqliteResultStore};

    use crate::settings::Settings;

    struct TagOnlyVision;

    #[async_trait]
    impl VisionAdapter for TagOnlyVision {
        fn name(&self) -> &str {
            "fake"
        }
        async fn describe(&self, _image: &ImageRef) -> Result<DescriptionResult, DeepEyesError> {
            Ok(DescriptionResult {
                tags: vec![Tag { name: "cat".into(), confidence: 0.97 }],
                ..Default::default()
            })
        }
        async fn start_text_job(&self, _: &ImageRef, _: &str) -> Result<JobId, DeepEyesError> {
            Err(DeepEyesError::permanent("fake", "no text expected"))
        }
        async fn poll_text_job(&self, _: &JobId) -> Result<JobStatus, DeepEyesError> {
            Err(DeepEyesError::permanent("fake", "no text expected"))
        }
    }

    fn app() -> (Router, Services) {
        let settings = Settings {
            config: DeepEyesConfig::default(),
            config_dir: PathBuf::from("/nonexistent"),
            config_path: PathBuf::from("/nonexistent/config.yaml"),
            report: Default::default(),
        };
        let services = Services::assemble(
            &settings,
            Arc::new(TagOnlyVision),
            Arc::new(SqliteResultStore::in_memory().unwrap()),
            Arc::new(SqliteCheckpointStore::in_memory().unwrap()),
            Arc::new(EventStore::in_memory().unwrap()),
        );
        let router = build_router(Arc::new(AppState { services: services.clone() }));
        (router, services)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (router, _) = app();
        let (status, body) = send(&router, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "deepeyes");
    }

    #[tokio::test]
    async fn ingest_runs_once_and_exposes_result() {
        let (router, services) = app();
        let request = json!({ "url": "https://img.example/cat.jpg", "eventId": "evt-1" });

        let (status, body) = send(&router, post_json("/api/ingest", request.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["outcome"], "started");
        let id: Uuid = serde_json::from_value(body["instanceId"].clone()).unwrap();

        let record = services.orchestrator.wait(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Completed);

        let (status, body) = send(&router, post_json("/api/ingest", request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "already_started");
        assert_eq!(body["status"]["state"], "completed");

        let (status, results) = send(&router, get("/results")).await;
        assert_eq!(status, StatusCode::OK);
        let results = results.as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["image"], "cat.jpg");
        assert_eq!(results[0]["ocr"]["state"], "NONE");

        let result_id = results[0]["id"].as_str().unwrap();
        let (status, _) = send(&router, get(&format!("/api/results/{result_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(services.results.list().await.unwrap().len(), 1);

        let (status, body) = send(&router, get(&format!("/api/instances/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instance"]["status"]["state"], "completed");

        let (status, body) = send(&router, get("/api/instances?limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["instances"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ingest_rejects_non_http_urls() {
        let (router, _) = app();
        let (status, _) =
            send(&router, post_json("/api/ingest", json!({ "url": "file:///etc/passwd" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&router, post_json("/api/ingest", json!({ "url": "nope" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let (router, _) = app();
        let id = Uuid::new_v4();
        let (status, _) = send(&router, get(&format!("/api/instances/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) =
            send(&router, post_json(&format!("/api/instances/{id}/cancel"), json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&router, get("/api/results/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancelling_a_finished_instance_conflicts() {
        let (router, services) = app();
        let (_, body) = send(
            &router,
            post_json("/api/ingest", json!({ "url": "https://img.example/dog.png" })),
        )
        .await;
        let id: Uuid = serde_json::from_value(body["instanceId"].clone()).unwrap();
        services.orchestrator.wait(id).await.unwrap();

        let (status, _) =
            send(&router, post_json(&format!("/api/instances/{id}/cancel"), json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
