//! HTTP intake for the host service.
//!
//! The backend talks to the host over a small JSON API. Each request is
//! turned into a [`HostRequest`](mandelbox_core::HostRequest) for the
//! orchestrator loop.
//!
//! ## Endpoints
//!
//! - `POST /json_transport` - Spin up a mandelbox
//! - `POST /drain_and_shutdown` - Stop accepting mandelboxes and shut down
//! - `GET /health` - Health check

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use mandelbox_core::{CoreError, Host, RequestSender, SpinUpRequest, SpinUpResult};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<Host>,
    pub requests: RequestSender,
}

/// A [`CoreError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

impl ApiError {
    /// Status code for the wrapped error.
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            e if e.is_capacity() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self.0, status = status.as_u16(), "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/json_transport", post(spin_up_handler))
        .route("/drain_and_shutdown", post(drain_handler))
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Spin up a mandelbox and return its host ports and key.
async fn spin_up_handler(
    State(state): State<AppState>,
    Json(request): Json<SpinUpRequest>,
) -> Result<Json<SpinUpResult>, ApiError> {
    if state.host.is_draining() {
        return Err(CoreError::Draining.into());
    }
    tracing::debug!(mandelbox_id = %request.mandelbox_id, app_name = %request.app_name, "Spin-up request");
    let result = state.requests.spin_up(request).await?;
    Ok(Json(result))
}

async fn drain_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.requests.drain_and_shutdown().await?;
    Ok(Json(serde_json::json!({ "status": "draining" })))
}

/// Health check endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": if state.host.is_draining() { "draining" } else { "healthy" },
        "service": "mandelbox-hostd",
        "mandelboxes": state.host.registry().len().await,
    }))
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use mandelbox_core::{Collaborators, HostConfig, KeepAlive, MandelboxId, Orchestrator};
    use std::time::Duration;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        host: Arc<Host>,
        _keepalive: KeepAlive,
        _dir: tempfile::TempDir,
    }

    fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::builder()
            .port_range(42000, 42100)
            .data_dir(dir.path())
            .ready_poll_interval(Duration::from_millis(5))
            .build()
            .unwrap();
        let host = Host::new(config, Collaborators::in_memory()).unwrap();
        let (orchestrator, requests, keepalive) = Orchestrator::new(host.clone());
        tokio::spawn(orchestrator.run());

        TestApp {
            router: build_router(AppState {
                host: host.clone(),
                requests,
            }),
            host,
            _keepalive: keepalive,
            _dir: dir,
        }
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: CoreError| ApiError(e).status();
        assert_eq!(status(CoreError::InvalidArgument("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(CoreError::Draining), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(CoreError::CapacityExhausted("ports".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(CoreError::external("runtime", "down")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let response = app
            .router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["mandelboxes"], 0);
    }

    #[tokio::test]
    async fn test_spin_up_over_http() {
        let app = app();
        let body = serde_json::json!({
            "app_name": "browsers/chrome",
            "mandelbox_id": MandelboxId::new(),
            "user_id": "user-1",
        });
        let response = app
            .router
            .clone()
            .oneshot(post_json("/json_transport", body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let result: SpinUpResult = serde_json::from_value(body_json(response).await).unwrap();
        assert!((42000..42100).contains(&result.host_port_for_tcp32262));
        assert_eq!(app.host.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_spin_up_rejects_empty_app_name() {
        let app = app();
        let body = serde_json::json!({ "app_name": "", "mandelbox_id": MandelboxId::new() });
        let response = app
            .router
            .oneshot(post_json("/json_transport", body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_spin_up_rejects_malformed_body() {
        let app = app();
        let response = app
            .router
            .oneshot(post_json("/json_transport", "{\"app_name\":".into()))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_drain_then_spin_up_is_unavailable() {
        let app = app();
        let response = app
            .router
            .clone()
            .oneshot(post_json("/drain_and_shutdown", String::new()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(app.host.is_draining());

        let body = serde_json::json!({ "app_name": "browsers/chrome", "mandelbox_id": MandelboxId::new() });
        let response = app
            .router
            .oneshot(post_json("/json_transport", body.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
