//! The request gate: token check, model filter and per-client rate limit.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use super::outcome::GateOutcome;
use super::request::{client_ip, header_str, model_alias};
use crate::config::GateConfig;
use crate::error::{GateError, Result};
use crate::ratelimit::{Clock, KeyScope, RateLimitKey, RateLimitPolicy};
use crate::store::RateLimitStore;

/// Decides, per request, whether it may reach the chat API.
///
/// The gate keeps no per-request state; all counters live in the store.
pub struct RequestGate {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    policy: RateLimitPolicy,
    models: Vec<String>,
    key_scope: KeyScope,
    gated_prefixes: Vec<String>,
    auth_header: HeaderName,
    auth_token: Option<String>,
    client_ip_header: HeaderName,
    fallback_ip: String,
}

impl RequestGate {
    /// Build a gate from configuration around an existing store and clock.
    pub fn new(
        config: &GateConfig,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            clock,
            policy: config.rate_limiting.policy(),
            models: config.rate_limiting.models.clone(),
            key_scope: config.rate_limiting.key_scope,
            gated_prefixes: config.gate.gated_prefixes.clone(),
            auth_header: parse_header_name(&config.auth.header)?,
            auth_token: config.auth.token.clone().filter(|t| !t.is_empty()),
            client_ip_header: parse_header_name(&config.gate.client_ip_header)?,
            fallback_ip: config.gate.fallback_ip.clone(),
        })
    }

    /// The store backing this gate.
    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// The limit applied to limited models.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Whether requests to `path` go through the gate at all.
    pub fn is_gated(&self, path: &str) -> bool {
        self.gated_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Whether the request carries the configured internal token.
    ///
    /// With no token configured nothing is authorized.
    pub fn is_authorized(&self, headers: &HeaderMap) -> bool {
        match (&self.auth_token, header_str(headers, &self.auth_header)) {
            (Some(expected), Some(presented)) => expected == presented,
            _ => false,
        }
    }

    /// Whether `model` is subject to rate limiting.
    pub fn is_limited_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Run the gate over one request.
    ///
    /// Only the token check can refuse a request for reasons other than the
    /// limit; body and store failures let it through.
    #[instrument(
        name = "gate",
        skip(self, headers, body),
        fields(request_id = %uuid::Uuid::new_v4())
    )]
    pub async fn evaluate(&self, path: &str, headers: &HeaderMap, body: &[u8]) -> GateOutcome {
        if !self.is_gated(path) {
            return GateOutcome::PassThrough;
        }

        info!(path = %path, "Handling API chat request");

        let ip = client_ip(headers, &self.client_ip_header, &self.fallback_ip);

        if !self.is_authorized(headers) {
            warn!(ip = %ip, "Invalid or missing internal API token");
            return GateOutcome::Forbidden;
        }

        let body: Value = match serde_json::from_slice(body) {
            Ok(body) => body,
            Err(e) => {
                error!(ip = %ip, error = %e, "Error parsing request body");
                return GateOutcome::BodyParseFallback;
            }
        };

        let model = match model_alias(&body) {
            Some(model) if self.is_limited_model(model) => model,
            other => {
                debug!(ip = %ip, model = ?other, "Model not rate limited");
                return GateOutcome::PassThrough;
            }
        };

        self.check_rate_limit(&ip, model).await
    }

    async fn check_rate_limit(&self, ip: &str, model: &str) -> GateOutcome {
        let key = RateLimitKey::new(self.key_scope, ip, model).to_string();
        let now = self.clock.now_millis();

        match self.store.hit(&key, now, &self.policy).await {
            Ok(decision) if decision.allowed => {
                debug!(
                    ip = %ip,
                    model = %model,
                    count = decision.next.count,
                    window_start = decision.next.window_start,
                    "Request within rate limit"
                );
                GateOutcome::PassThrough
            }
            Ok(decision) => {
                let retry_after = decision.retry_after_secs.unwrap_or(0);
                warn!(
                    ip = %ip,
                    model = %model,
                    count = decision.next.count,
                    window_start = decision.next.window_start,
                    retry_after,
                    "Rate limit exceeded"
                );
                GateOutcome::RateLimited { retry_after }
            }
            Err(e) => {
                error!(
                    ip = %ip,
                    model = %model,
                    backend = self.store.backend(),
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                GateOutcome::PassThrough
            }
        }
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| GateError::Config(format!("invalid header name {:?}: {}", name, e)))
}
