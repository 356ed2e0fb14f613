//! API Router configuration

use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let server = state.substrate.config().server.clone();

    let api_routes = Router::new()
        .route("/events", post(handlers::append_event))
        .route("/export", get(handlers::export_ledger))
        .route("/proof/:event_id", get(handlers::get_proof))
        .route("/halt", post(handlers::trigger_halt))
        .route("/tasks/:task_id", get(handlers::get_task))
        .route("/health", get(handlers::health_check));

    let mut app = Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(
            server.request_timeout_secs.max(1),
        )));

    if server.enable_cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    app.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use conclave_kernel_chain::Envelope;
    use conclave_kernel_halt::HaltReport;
    use conclave_kernel_lifecycle::{TaskRecord, TaskState};
    use conclave_kernel_merkle::InclusionProof;
    use conclave_substrate::{Substrate, SubstrateConfig};
    use serde::de::DeserializeOwned;
    use serde_json::json;
    use tower::ServiceExt;

    async fn test_router() -> (Router, Arc<Substrate>) {
        let mut config = SubstrateConfig::in_memory();
        config.server.halt_token = Some("s3cret".into());
        config.merkle.epoch_size = 2;
        let substrate = Arc::new(Substrate::open(config).await.unwrap());
        (create_router(AppState::new(substrate.clone())), substrate)
    }

    async fn body<T: DeserializeOwned>(resp: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn post_event(app: &Router, draft: serde_json::Value) -> axum::response::Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_string(&draft).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn post_halt(app: &Router, token: Option<&str>) -> axum::response::Response {
        let mut request = Request::builder().method("POST").uri("/api/v1/halt");
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        app.clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn get(app: &Router, uri: &str) -> axum::response::Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn authorize(task: &str) -> serde_json::Value {
        json!({
            "event_type": "executive.task.authorized",
            "actor_id": "earl-1",
            "payload": { "task_id": task }
        })
    }

    #[tokio::test]
    async fn append_returns_the_committed_envelope() {
        let (app, _) = test_router().await;
        let resp = post_event(&app, authorize("T1")).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let envelope: Envelope = body(resp).await;
        assert_eq!(envelope.sequence, 1);
        assert_eq!(envelope.event_type, "executive.task.authorized");

        let resp = get(&app, "/api/v1/tasks/T1").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let task: TaskRecord = body(resp).await;
        assert_eq!(task.current_state, TaskState::Authorized);
    }

    #[tokio::test]
    async fn illegal_transition_is_a_conflict() {
        let (app, _) = test_router().await;
        post_event(&app, authorize("T1")).await;
        let resp = post_event(
            &app,
            json!({
                "event_type": "executive.task.completed",
                "actor_id": "earl-1",
                "payload": { "task_id": "T1" }
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let error: serde_json::Value = body(resp).await;
        assert_eq!(error["code"], "ILLEGAL_TRANSITION");
        assert_eq!(error["details"]["task_id"], "T1");
    }

    #[tokio::test]
    async fn draft_with_ledger_fields_is_refused() {
        let (app, _) = test_router().await;
        let mut draft = authorize("T1");
        draft["sequence"] = json!(7);
        let resp = post_event(&app, draft).await;
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn halt_needs_the_token_and_is_idempotent() {
        let (app, substrate) = test_router().await;

        assert_eq!(post_halt(&app, None).await.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(post_halt(&app, Some("nope")).await.status(), StatusCode::UNAUTHORIZED);
        assert!(!substrate.flag().is_halted());

        let first: HaltReport = body(post_halt(&app, Some("s3cret")).await).await;
        assert!(first.newly_triggered);
        let second: HaltReport = body(post_halt(&app, Some("s3cret")).await).await;
        assert!(!second.newly_triggered);
        assert_eq!(first.epoch, second.epoch);

        let resp = post_event(&app, authorize("T9")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Reads stay open while halted.
        let resp = get(&app, "/api/v1/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let health: serde_json::Value = body(resp).await;
        assert_eq!(health["status"], "halted");
        assert_eq!(get(&app, "/api/v1/export").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn proof_for_sealed_event_verifies() {
        let (app, substrate) = test_router().await;
        let envelope: Envelope = body(post_event(&app, authorize("T1")).await).await;
        post_event(&app, authorize("T2")).await;
        substrate.merkle().catch_up().await.unwrap();

        let resp = get(&app, &format!("/api/v1/proof/{}", envelope.event_id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let proof: InclusionProof = body(resp).await;
        assert_eq!(proof.event_hash, envelope.hash);
        assert!(proof.verify());

        assert_eq!(get(&app, "/api/v1/proof/not-a-uuid").await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let (app, _) = test_router().await;
        assert_eq!(get(&app, "/api/v1/tasks/ghost").await.status(), StatusCode::NOT_FOUND);
    }
}
