//! HTTP intake for host events and adhoc task requests

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use o365_sync::{HostEvent, HostEventHandlers, TaskRegistry, TaskRequest, TaskSink};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::telemetry::DaemonMetrics;

#[derive(Clone)]
pub struct ApiState {
    pub handlers: Arc<HostEventHandlers>,
    /// Where adhoc task requests go
    pub sink: Arc<dyn TaskSink>,
    pub registry: Arc<TaskRegistry>,
    pub metrics: DaemonMetrics,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub handled: bool,
}

#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub identity: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(receive_event))
        .route("/tasks", post(queue_task))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// POST /events - handle one host event
///
/// Responds 200 when the event was handled or had nothing to do, 500 when
/// handling failed. Failures are logged by the handlers.
async fn receive_event(State(state): State<ApiState>, Json(event): Json<HostEvent>) -> Response {
    let handled = state.handlers.handle(&event).await;

    let kind = serde_json::to_value(event.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    let status = if handled { "handled" } else { "failed" };
    state
        .metrics
        .host_events_total
        .with_label_values(&[&kind, status])
        .inc();

    let code = if handled {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(EventResponse { handled })).into_response()
}

/// POST /tasks - queue a task for the dispatcher
async fn queue_task(State(state): State<ApiState>, Json(request): Json<TaskRequest>) -> Response {
    if state.registry.get(&request.task).is_none() {
        let body = Json(ErrorResponse {
            error: format!("Unknown task: {}", request.task),
        });
        return (StatusCode::BAD_REQUEST, body).into_response();
    }

    let identity = request.identity();
    state.sink.enqueue(request);
    (StatusCode::ACCEPTED, Json(QueuedResponse { identity })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::tests::create_test_config;
    use crate::daemon::{ChannelSink, DispatchRequest, SyncRuntime, TriggerSource};
    use o365_sync::tasks::GROUP_MEMBERSHIP;
    use o365_sync::HostEventKind;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn create_test_state(dir: &std::path::Path) -> (ApiState, mpsc::Receiver<DispatchRequest>) {
        let runtime = SyncRuntime::build(&create_test_config(dir)).unwrap();
        let (tx, rx) = mpsc::channel(8);
        let handlers =
            runtime.handlers(Arc::new(ChannelSink::new(tx.clone(), TriggerSource::HostEvent)));
        let state = ApiState {
            handlers: Arc::new(handlers),
            sink: Arc::new(ChannelSink::new(tx, TriggerSource::Adhoc)),
            registry: runtime.registry.clone(),
            metrics: DaemonMetrics::new().unwrap(),
        };
        (state, rx)
    }

    #[tokio::test]
    async fn test_event_is_handled_and_counted() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, mut rx) = create_test_state(dir.path());

        let event = HostEvent::new(HostEventKind::UserEnrolled).user(3).course(100);
        let response = receive_event(State(state.clone()), Json(event)).await;

        assert_eq!(response.status(), StatusCode::OK);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.request.task, GROUP_MEMBERSHIP);
        assert_eq!(first.source, TriggerSource::HostEvent);
        assert!(rx.try_recv().is_ok(), "course team is queued too");
        assert_eq!(
            state
                .metrics
                .host_events_total
                .with_label_values(&["user_enrolled", "handled"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn test_event_missing_ids_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, _rx) = create_test_state(dir.path());

        let response =
            receive_event(State(state), Json(HostEvent::new(HostEventKind::CourseCreated))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_known_task_is_queued() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, mut rx) = create_test_state(dir.path());

        let request = TaskRequest::new(GROUP_MEMBERSHIP, json!({"subtype": "course", "local_id": 100}));
        let response = queue_task(State(state), Json(request.clone())).await;

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.request, request);
        assert_eq!(queued.source, TriggerSource::Adhoc);
    }

    #[tokio::test]
    async fn test_unknown_task_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, mut rx) = create_test_state(dir.path());

        let response = queue_task(
            State(state),
            Json(TaskRequest::new("reindex", serde_json::Value::Null)),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }
}
