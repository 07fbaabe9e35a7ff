use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bouncer::auth::{AuthGuard, HttpAuthProvider};
use bouncer::config::{BouncerConfig, StoreKind};
use bouncer::http::{AppState, HttpServer, Pipeline};
use bouncer::ratelimit::{spawn_sweeper, MemoryStore, RateLimitStore, RateLimiter, RedisStore};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Brute-force protection for authentication endpoints.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "BOUNCER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
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

    info!("Starting Bouncer");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = BouncerConfig::load(cli.config.as_deref())?;
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let rate_limiting = &config.rate_limiting;
    let store: Arc<dyn RateLimitStore> = match rate_limiting.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Redis => {
            let url = rate_limiting
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("rate_limiting.redis_url is not set"))?;
            Arc::new(RedisStore::open(url, rate_limiting.key_prefix.clone())?)
        }
    };

    let limiter = Arc::new(
        RateLimiter::new(store)
            .with_failure_mode(rate_limiting.failure_mode)
            .with_lockout_policy(rate_limiting.lockout_policy),
    );
    info!(
        store = ?rate_limiting.store,
        failure_mode = ?rate_limiting.failure_mode,
        lockout_policy = ?rate_limiting.lockout_policy,
        "Rate limiter initialized"
    );

    let sweeper = (rate_limiting.sweep_interval_secs > 0).then(|| {
        spawn_sweeper(
            limiter.clone(),
            Duration::from_secs(rate_limiting.sweep_interval_secs),
        )
    });

    let provider = Arc::new(HttpAuthProvider::new(&config.upstream)?);
    let guard = Arc::new(AuthGuard::new(
        limiter.clone(),
        provider,
        rate_limiting.limits,
    ));

    let pipeline = Pipeline::from_config(&config, limiter);
    let server = HttpServer::new(config.server.http_addr, AppState { guard }, pipeline);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Bouncer stopped");
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
            Ok(mut stream) => {
                stream.recv().await;
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
