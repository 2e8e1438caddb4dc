//! HTTP server for the gated chat API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::gate_requests;
use super::AppState;
use crate::error::{GateError, Result};

/// Build the router: a health check, and everything else forwarded upstream
/// behind the gate.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(forward)
        .layer(middleware::from_fn_with_state(state.clone(), gate_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "backend": state.gate.store().backend(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn forward(State(state): State<Arc<AppState>>, request: Request) -> Response {
    state.upstream.forward(request).await
}

/// HTTP server hosting the gate.
pub struct GateServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared gate, upstream and routing state
    state: Arc<AppState>,
}

impl GateServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { addr, state }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            backend = self.state.gate.store().backend(),
            "Starting HTTP server for the chat API gate"
        );

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GateError::Server(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::gate::RequestGate;
    use crate::http::Upstream;
    use crate::ratelimit::ManualClock;
    use crate::store::testing::RecordingStore;
    use crate::store::RateLimitStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, StatusCode};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    const TOKEN: &str = "internal-secret";

    /// Downstream stand-in echoing the path and body it received.
    async fn echo(request: Request) -> Json<Value> {
        let path = request.uri().path().to_string();
        let bytes = to_bytes(request.into_body(), usize::MAX).await.unwrap();
        Json(json!({ "path": path, "body": String::from_utf8_lossy(&bytes) }))
    }

    async fn spawn_upstream() -> String {
        let app = Router::new().fallback(echo);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn app(store: Arc<dyn RateLimitStore>) -> Router {
        let mut config = GateConfig::default();
        config.auth.token = Some(TOKEN.to_string());
        config.rate_limiting.limit = 2;

        let gate = RequestGate::new(&config, store, Arc::new(ManualClock::new(0))).unwrap();
        let upstream = Upstream::new(&spawn_upstream().await, Duration::from_secs(5)).unwrap();

        router(Arc::new(AppState {
            gate,
            upstream,
            rewrites: config.gate.rewrites.clone(),
            max_body_bytes: 64,
        }))
    }

    fn chat(path: &str, token: Option<&str>, body: impl Into<Body>) -> Request {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "1.2.3.4");
        if let Some(token) = token {
            builder = builder.header("X-Internal-API-Token", token);
        }
        let body: Body = body.into();
        builder.body(body).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_not_gated() {
        let app = app(Arc::new(RecordingStore::new())).await;

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["backend"], "recording");
    }

    #[tokio::test]
    async fn test_forbidden_without_token() {
        let store = Arc::new(RecordingStore::new());
        let app = app(store.clone()).await;

        let response = app
            .oneshot(chat("/api/chat", None, r#"{"modelAlias":"NPT 1.5"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            json_body(response).await,
            json!({"success": false, "message": "Forbidden"})
        );
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_allowed_request_reaches_upstream_with_body() {
        let app = app(Arc::new(RecordingStore::new())).await;

        let response = app
            .oneshot(chat("/api/chat", Some(TOKEN), r#"{"modelAlias":"NPT 1.5"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["path"], "/api/chat");
        assert_eq!(body["body"], r#"{"modelAlias":"NPT 1.5"}"#);
    }

    #[tokio::test]
    async fn test_rate_limited_after_limit() {
        let app = app(Arc::new(RecordingStore::new())).await;

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(chat("/api/chat", Some(TOKEN), r#"{"modelAlias":"NPT 1.5"}"#))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app
            .oneshot(chat("/api/chat", Some(TOKEN), r#"{"modelAlias":"NPT 1.5"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        let body = json_body(response).await;
        assert_eq!(body["message"], "Rate limit exceeded for this model.");
        assert_eq!(body["retryAfter"], 60);
    }

    #[tokio::test]
    async fn test_rewritten_alias_is_gated_and_forwarded_to_destination() {
        let app = app(Arc::new(RecordingStore::new())).await;

        let forbidden = app
            .clone()
            .oneshot(chat("/api/opengen/v1/chat/completions", None, "{}"))
            .await
            .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(chat("/api/opengen/v1/chat/completions", Some(TOKEN), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["path"], "/api/chat");
    }

    #[tokio::test]
    async fn test_unparsable_body_is_forwarded() {
        let store = Arc::new(RecordingStore::new());
        let app = app(store.clone()).await;

        let response = app
            .oneshot(chat("/api/chat", Some(TOKEN), "{not json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["body"], "{not json");
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_ungated_path_is_forwarded_without_token() {
        let app = app(Arc::new(RecordingStore::new())).await;

        let response = app
            .oneshot(chat("/api/models", None, "{}"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["path"], "/api/models");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let app = app(Arc::new(RecordingStore::new())).await;
        let body = r#"{"modelAlias":"NPT 1.5","messages":["0123456789012345678901234567890123456789"]}"#;

        let response = app
            .oneshot(chat("/api/chat", Some(TOKEN), body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_oversized_body_without_token_is_forbidden() {
        let store = Arc::new(RecordingStore::new());
        let app = app(store.clone()).await;
        let body = format!(r#"{{"modelAlias":"NPT 1.5","messages":["{}"]}}"#, "x".repeat(200));

        let response = app.oneshot(chat("/api/chat", None, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            json_body(response).await,
            json!({"success": false, "message": "Forbidden"})
        );
        assert_eq!(store.calls(), 0);
    }
}
