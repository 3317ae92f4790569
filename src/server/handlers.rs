use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::compute::{execute_request, ComputeRequest};
use crate::pool::http::WorkersResponse;
use crate::server::state::WorkerState;

fn check_auth(state: &WorkerState, headers: &HeaderMap) -> Result<(), Response> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if state.authorize(header) {
        Ok(())
    } else {
        warn!("Rejected request with missing or invalid API key");
        Err((StatusCode::UNAUTHORIZED, "Invalid API key").into_response())
    }
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Worker ids this server answers for
pub async fn list_workers(State(state): State<WorkerState>, headers: HeaderMap) -> Response {
    if let Err(rejected) = check_auth(&state, &headers) {
        return rejected;
    }
    Json(WorkersResponse {
        workers: state.worker_ids.as_ref().clone(),
    })
    .into_response()
}

/// Run one compute request. Failures of the compute code are part of the
/// 200 response body; only server-side faults produce an error status.
pub async fn compute(
    State(state): State<WorkerState>,
    headers: HeaderMap,
    Json(request): Json<ComputeRequest>,
) -> Response {
    if let Err(rejected) = check_auth(&state, &headers) {
        return rejected;
    }

    let _permit = match state.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "Worker is shutting down").into_response();
        }
    };

    let request_id = request.request_id;
    debug!("Running request {} ('{}')", request_id, request.code.name);
    let registry = state.registry.clone();
    match tokio::task::spawn_blocking(move || execute_request(&registry, request)).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            error!("Request {} could not be executed: {}", request_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Create the Axum router
pub fn create_router(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/workers", get(list_workers))
        .route("/v1/compute", post(compute))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::compute::{
        CodeRef, ComputeOutcome, ComputeRegistry, ComputeResult, InputSnapshot,
    };

    fn create_test_app(api_key: Option<&str>) -> Router {
        let state = WorkerState::new(Arc::new(ComputeRegistry::with_builtins()), 2);
        let state = match api_key {
            Some(key) => state.with_api_key(key),
            None => state,
        };
        create_router(state)
    }

    fn compute_request(name: &str, inputs: InputSnapshot) -> Request<Body> {
        let request = ComputeRequest::new(
            CodeRef {
                name: name.to_string(),
                origin: "__remote__".to_string(),
            },
            inputs,
        );
        Request::builder()
            .method("POST")
            .uri("/v1/compute")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&request).unwrap()))
            .unwrap()
    }

    async fn read_result(response: Response) -> ComputeResult {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = create_test_app(None)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_workers_endpoint() {
        let response = create_test_app(None)
            .oneshot(Request::builder().uri("/v1/workers").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"workers": ["0", "1"]}));
    }

    #[tokio::test]
    async fn test_compute_endpoint() {
        let inputs = InputSnapshot::new().with_value("x", json!(2.0));
        let response = create_test_app(None)
            .oneshot(compute_request("double", inputs))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let result = read_result(response).await;
        match result.outcome {
            ComputeOutcome::Success { outputs } => assert_eq!(outputs["y"], json!(4.0)),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!result.machine.name.is_empty());
    }

    #[tokio::test]
    async fn test_compute_failure_is_ok_response() {
        let response = create_test_app(None)
            .oneshot(compute_request("fail", InputSnapshot::new()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let result = read_result(response).await;
        assert!(!result.outcome.is_success());
        assert_eq!(
            result.outcome.error_message().as_deref(),
            Some("RuntimeError: requested failure")
        );
    }

    #[tokio::test]
    async fn test_api_key_required() {
        let app = create_test_app(Some("secret"));

        let rejected = app
            .clone()
            .oneshot(compute_request("double", InputSnapshot::new()))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

        let mut request = compute_request("double", InputSnapshot::new().with_value("x", json!(1)));
        request
            .headers_mut()
            .insert(AUTHORIZATION, "Bearer secret".parse().unwrap());
        let accepted = app.oneshot(request).await.unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);
    }
}
