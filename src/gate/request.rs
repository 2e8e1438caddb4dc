//! Reading the parts of an inbound request the gate cares about.

use axum::http::{HeaderMap, HeaderName};
use serde_json::Value;

/// Client IP from the forwarded-for style header.
///
/// Proxies append to the header, so the first entry is the original client.
/// A missing, non-UTF-8 or empty header yields `fallback`.
pub fn client_ip(headers: &HeaderMap, header: &HeaderName, fallback: &str) -> String {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Header value as text, if present and valid UTF-8.
pub fn header_str<'a>(headers: &'a HeaderMap, header: &HeaderName) -> Option<&'a str> {
    headers.get(header).and_then(|v| v.to_str().ok())
}

/// Model alias declared by a parsed request body, if any.
///
/// Bodies that are valid JSON but not an object, or whose `modelAlias`
/// is not a string, declare no model.
pub fn model_alias(body: &Value) -> Option<&str> {
    body.get("modelAlias").and_then(Value::as_str)
}
