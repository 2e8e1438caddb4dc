//! Terminal states of the gate and the responses they produce.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Where a request ends up after the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Forward to the downstream handler untouched
    PassThrough,
    /// Missing or wrong internal token
    Forbidden,
    /// Over the limit for the current window
    RateLimited { retry_after: u64 },
    /// Body could not be parsed; forwarded without rate limiting
    BodyParseFallback,
}

impl GateOutcome {
    /// Whether the request continues to the downstream handler.
    pub fn is_forwarded(&self) -> bool {
        matches!(self, GateOutcome::PassThrough | GateOutcome::BodyParseFallback)
    }
}

/// JSON body of a gate rejection.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub success: bool,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl Rejection {
    pub fn new(message: &'static str) -> Self {
        Self {
            success: false,
            message,
            retry_after: None,
        }
    }
}

impl IntoResponse for GateOutcome {
    /// Rejections become 403/429 JSON responses. Forwarded outcomes have no
    /// response of their own; the middleware never renders them, and they map
    /// to an empty 200 only so the conversion is total.
    fn into_response(self) -> Response {
        match self {
            GateOutcome::Forbidden => {
                (StatusCode::FORBIDDEN, Json(Rejection::new("Forbidden"))).into_response()
            }
            GateOutcome::RateLimited { retry_after } => {
                let body = Rejection {
                    retry_after: Some(retry_after),
                    ..Rejection::new("Rate limit exceeded for this model.")
                };
                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            GateOutcome::PassThrough | GateOutcome::BodyParseFallback => {
                StatusCode::OK.into_response()
            }
        }
    }
}
