//! Axum middleware running the gate in front of every route.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, error, warn};

use super::AppState;
use crate::config::Rewrite;
use crate::gate::{GateOutcome, Rejection};

/// Destination for `path` if it matches a rewrite source exactly.
pub fn resolve_rewrite<'a>(rewrites: &'a [Rewrite], path: &str) -> Option<&'a str> {
    rewrites
        .iter()
        .find(|r| r.source == path)
        .map(|r| r.destination.as_str())
}

/// Apply path rewrites, then gate requests on gated paths.
///
/// Gated bodies are buffered so the gate can read them and the original
/// bytes can still be forwarded. Unauthorized requests are refused before
/// their body is read.
pub async fn gate_requests(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let request = rewrite_request(&state.rewrites, request);
    let path = request.uri().path().to_string();

    if !state.gate.is_gated(&path) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();

    if !state.gate.is_authorized(&parts.headers) {
        warn!(path = %path, "Invalid or missing internal API token");
        return GateOutcome::Forbidden.into_response();
    }

    let bytes = match to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(path = %path, error = %e, "Failed to read request body");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(Rejection::new("Payload Too Large")),
            )
                .into_response();
        }
    };

    let outcome = state.gate.evaluate(&path, &parts.headers, &bytes).await;
    if !outcome.is_forwarded() {
        return outcome.into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

fn rewrite_request(rewrites: &[Rewrite], mut request: Request) -> Request {
    let Some(destination) = resolve_rewrite(rewrites, request.uri().path()) else {
        return request;
    };

    let target = match request.uri().query() {
        Some(query) => format!("{}?{}", destination, query),
        None => destination.to_string(),
    };

    match target.parse::<Uri>() {
        Ok(uri) => {
            debug!(from = %request.uri().path(), to = %destination, "Rewriting request path");
            *request.uri_mut() = uri;
        }
        Err(e) => error!(destination = %destination, error = %e, "Invalid rewrite destination"),
    }
    request
}
