//! Configuration management for Modelgate.
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML
//! file, `MODELGATE__SECTION__FIELD` environment variables, then whatever
//! the binary applies on top from its command line.

use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, Result};
use crate::ratelimit::{KeyScope, RateLimitPolicy, DEFAULT_LIMIT, DEFAULT_WINDOW_MS};

/// Main configuration for the gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Listener and upstream
    #[serde(default)]
    pub server: ServerConfig,

    /// Which requests are gated and how they are read
    #[serde(default)]
    pub gate: RoutingConfig,

    /// Internal caller authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Durable store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Base URL requests are forwarded to once they pass the gate
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Upstream request timeout in milliseconds
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            upstream_url: default_upstream_url(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_upstream_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    120_000
}

/// A path alias resolved before the gate runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewrite {
    pub source: String,
    pub destination: String,
}

/// Request routing and parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Path prefixes that enter the gate
    #[serde(default = "default_gated_prefixes")]
    pub gated_prefixes: Vec<String>,

    /// Header carrying the client IP
    #[serde(default = "default_client_ip_header")]
    pub client_ip_header: String,

    /// Client IP used when the header is missing
    #[serde(default = "default_fallback_ip")]
    pub fallback_ip: String,

    /// Largest gated body buffered for inspection.
    ///
    /// Authorized requests over this size are answered with 413 rather than
    /// forwarded, since the body cannot be inspected or replayed intact.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Exact-path aliases
    #[serde(default = "default_rewrites")]
    pub rewrites: Vec<Rewrite>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            gated_prefixes: default_gated_prefixes(),
            client_ip_header: default_client_ip_header(),
            fallback_ip: default_fallback_ip(),
            max_body_bytes: default_max_body_bytes(),
            rewrites: default_rewrites(),
        }
    }
}

fn default_gated_prefixes() -> Vec<String> {
    vec!["/api/chat".to_string()]
}

fn default_client_ip_header() -> String {
    "x-forwarded-for".to_string()
}

fn default_fallback_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_rewrites() -> Vec<Rewrite> {
    vec![Rewrite {
        source: "/api/opengen/v1/chat/completions".to_string(),
        destination: "/api/chat".to_string(),
    }]
}

/// Internal caller authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the caller's token
    #[serde(default = "default_auth_header")]
    pub header: String,

    /// Expected token; when unset every gated request is refused
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: default_auth_header(),
            token: None,
        }
    }
}

fn default_auth_header() -> String {
    "X-Internal-API-Token".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Model aliases subject to the limit
    #[serde(default = "default_models")]
    pub models: Vec<String>,

    /// Record keying
    #[serde(default)]
    pub key_scope: KeyScope,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_ms: default_window_ms(),
            models: default_models(),
            key_scope: KeyScope::default(),
        }
    }
}

impl RateLimitingConfig {
    /// The policy these settings describe.
    pub fn policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            limit: self.limit,
            window_ms: self.window_ms,
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_models() -> Vec<String> {
    vec!["NPT 1.5".to_string()]
}

/// Durable store configuration. Both `url` and `auth_token` select libSQL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database URL (`libsql://…` or `https://…`)
    #[serde(default)]
    pub url: Option<String>,

    /// Database auth token
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Table holding the records
    #[serde(default = "default_table")]
    pub table: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,

    /// Expired-record sweep interval in seconds, 0 to disable
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            auth_token: None,
            table: default_table(),
            timeout_ms: default_store_timeout_ms(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sweep interval, or `None` when sweeping is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

fn default_table() -> String {
    "rate_limits".to_string()
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_sweep_interval() -> u64 {
    300
}

impl GateConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        }
        let config: GateConfig = builder
            .add_source(
                Environment::with_prefix("MODELGATE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("gate.gated_prefixes")
                    .with_list_parse_key("rate_limiting.models")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<GateConfig>())
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize::<GateConfig>())
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gate cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.limit == 0 {
            return Err(GateError::Config("rate_limiting.limit must be positive".to_string()));
        }
        if self.rate_limiting.window_ms == 0 {
            return Err(GateError::Config("rate_limiting.window_ms must be positive".to_string()));
        }
        if self.gate.gated_prefixes.is_empty() {
            return Err(GateError::Config("gate.gated_prefixes must not be empty".to_string()));
        }
        if self.auth.header.is_empty() {
            return Err(GateError::Config("auth.header must not be empty".to_string()));
        }
        Ok(())
    }
}
