use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use modelgate::config::GateConfig;
use modelgate::gate::RequestGate;
use modelgate::http::{AppState, GateServer, Upstream};
use modelgate::ratelimit::{Clock, SystemClock};
use modelgate::store::{build_store, spawn_sweeper};

/// Log output format.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Command line arguments. Flags override the configuration file and
/// `MODELGATE__*` environment variables.
#[derive(Parser, Debug)]
#[command(name = "modelgate")]
#[command(about = "Authenticating, rate limiting gate for a chat-completions API", version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "MODELGATE_CONFIG")]
    config: Option<String>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Downstream chat service base URL
    #[arg(short, long)]
    upstream: Option<String>,

    /// libSQL database URL
    #[arg(long, env = "TURSO_DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// libSQL auth token
    #[arg(long, env = "TURSO_AUTH_TOKEN", hide_env_values = true)]
    database_auth_token: Option<String>,

    /// Shared token internal callers must present
    #[arg(long, env = "INTERNAL_API_TOKEN", hide_env_values = true)]
    internal_api_token: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

impl Args {
    /// Apply command line and well-known environment overrides.
    fn apply(&self, config: &mut GateConfig) {
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(upstream) = &self.upstream {
            config.server.upstream_url = upstream.clone();
        }
        if let Some(url) = &self.database_url {
            config.store.url = Some(url.clone());
        }
        if let Some(token) = &self.database_auth_token {
            config.store.auth_token = Some(token.clone());
        }
        if let Some(token) = &self.internal_api_token {
            config.auth.token = Some(token.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init(),
    }

    info!("Starting Modelgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = GateConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        upstream = %config.server.upstream_url,
        limit = config.rate_limiting.limit,
        window_ms = config.rate_limiting.window_ms,
        models = ?config.rate_limiting.models,
        auth_configured = config.auth.token.is_some(),
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = build_store(&config.store).await;

    if let Some(every) = config.store.sweep_interval() {
        spawn_sweeper(store.clone(), clock.clone(), config.rate_limiting.policy().window(), every);
    }

    let gate = RequestGate::new(&config, store, clock)?;
    let upstream = Upstream::new(
        &config.server.upstream_url,
        Duration::from_millis(config.server.upstream_timeout_ms),
    )?;

    let state = Arc::new(AppState {
        gate,
        upstream,
        rewrites: config.gate.rewrites.clone(),
        max_body_bytes: config.gate.max_body_bytes,
    });

    // Run the server with graceful shutdown on Ctrl+C
    GateServer::new(config.server.listen_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Modelgate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
