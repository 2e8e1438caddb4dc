//! Forwarding of admitted requests to the downstream chat service.

use std::time::Duration;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{debug, error};

use crate::error::{GateError, Result};
use crate::gate::Rejection;

/// Headers that describe one hop rather than the request itself.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// HTTP client for the downstream service.
#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    base_url: String,
}

impl Upstream {
    /// Create a client forwarding to `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::Server(format!("failed to build upstream client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Forward `request` and stream the downstream response back.
    ///
    /// An unreachable downstream becomes a 502.
    pub async fn forward(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path_and_query);

        debug!(method = %parts.method, url = %url, "Forwarding request upstream");

        let result = self
            .client
            .request(parts.method, &url)
            .headers(strip_hop_by_hop(parts.headers))
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        match result {
            Ok(upstream) => {
                let status = upstream.status();
                let headers = strip_hop_by_hop(upstream.headers().clone());
                let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(e) => {
                error!(url = %url, error = %e, "Upstream request failed");
                (StatusCode::BAD_GATEWAY, Json(Rejection::new("Bad Gateway"))).into_response()
            }
        }
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);
    headers
}
