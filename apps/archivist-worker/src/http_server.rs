use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use archivist_node::{BackpressureController, BatchUploader};
use archivist_queue::Broker;

#[derive(Clone)]
pub struct WorkerAppState {
    pub broker: Arc<dyn Broker>,
    pub uploader: Arc<BatchUploader>,
    pub backpressure: BackpressureController,
}

pub fn build_router(state: WorkerAppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "health": "ok" }))
}

async fn metrics(State(state): State<WorkerAppState>) -> impl IntoResponse {
    metrics_body(&state)
}

fn metrics_body(state: &WorkerAppState) -> String {
    let broker = state.broker.health_snapshot();
    let source = &state.uploader.config().intake_source;
    format!(
        "archivist_broker_published_total {}\narchivist_broker_delivered_total {}\narchivist_broker_acked_total {}\narchivist_broker_requeued_total {}\narchivist_broker_dead_lettered_total {}\narchivist_broker_dropped_total {}\narchivist_pending_items {}\narchivist_intake_paused {}\n",
        broker.published,
        broker.delivered,
        broker.acked,
        broker.requeued,
        broker.dead_lettered,
        broker.dropped,
        state.uploader.pending(),
        u8::from(state.backpressure.is_paused(source)),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use archivist_node::{
        BackpressureController, BatchUploader, MemoryObjectStore, ProbeConfig, ProbeError,
        ProbeFn, UploaderConfig,
    };
    use archivist_queue::{DelayedQueue, InMemoryBroker};

    use super::{build_router, WorkerAppState};
    use crate::ledger_client::GatewayLedger;

    fn test_state() -> WorkerAppState {
        let broker = Arc::new(InMemoryBroker::new());
        let backpressure = BackpressureController::new();
        let ledger = GatewayLedger::new("http://127.0.0.1:9", Duration::from_secs(1))
            .expect("ledger client");
        let uploader = BatchUploader::new(
            DelayedQueue::new(broker.clone()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(ledger),
            backpressure.clone(),
            UploaderConfig::default(),
        );
        WorkerAppState {
            broker,
            uploader,
            backpressure,
        }
    }

    async fn get_body(app: axum::Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (status, body) = get_body(build_router(test_state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed, serde_json::json!({ "health": "ok" }));
    }

    #[tokio::test]
    async fn metrics_expose_pool_and_pause_state() {
        let state = test_state();
        let (_, body) = get_body(build_router(state.clone()), "/metrics").await;
        assert!(body.contains("archivist_pending_items 0\n"));
        assert!(body.contains("archivist_intake_paused 0\n"));

        let probe = ProbeFn(|| async { Ok::<bool, ProbeError>(false) });
        state.backpressure.pause(
            "upload",
            ProbeConfig::new(Arc::new(probe), Duration::from_secs(3600)),
        );
        let (_, body) = get_body(build_router(state), "/metrics").await;
        assert!(body.contains("archivist_intake_paused 1\n"));
    }

    #[tokio::test]
    async fn metrics_report_broker_traffic() {
        let state = test_state();
        let queue = DelayedQueue::new(state.broker.clone());
        queue
            .publish_now("upload", &serde_json::json!({ "chunkId": "x" }))
            .await
            .expect("publish");
        let (_, body) = get_body(build_router(state), "/metrics").await;
        assert!(body.contains("archivist_broker_published_total 1\n"));
        assert!(body.contains("archivist_broker_dropped_total 0\n"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let (status, _) = get_body(build_router(test_state()), "/admin").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
