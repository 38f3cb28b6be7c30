use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use throttlex::config::{LogFormat, LoggingConfig, StoreBackend, ThrottlexConfig};
use throttlex::http::HttpServer;
use throttlex::metrics::{Metrics, PrometheusObserver};
use throttlex::ratelimit::{
    load_seed_file, DecisionObserver, FanoutObserver, LimiterSettings, RateLimiter, SystemClock,
    TracingObserver,
};
use throttlex::store;

/// Multi-tenant rate limiting service.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    addr: Option<String>,

    /// Use the in-memory store (single instance only)
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ThrottlexConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if args.memory {
        config.store.backend = StoreBackend::Memory;
    }
    config.validate()?;

    init_tracing(&config.logging);

    info!("Starting ThrottleX Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        addr = %config.server.addr,
        backend = ?config.store.backend,
        failure_mode = ?config.rate_limiting.failure_mode,
        "Configuration loaded"
    );

    let store = store::connect(&config.store, Arc::new(SystemClock)).await?;
    let metrics = Arc::new(Metrics::new()?);
    let observers: Vec<Arc<dyn DecisionObserver>> = vec![
        Arc::new(TracingObserver),
        Arc::new(PrometheusObserver::new(metrics.clone())),
    ];

    let rate_limiter = Arc::new(
        RateLimiter::new(
            store,
            LimiterSettings {
                default_policy: config.rate_limiting.default_policy(),
                failure_mode: config.rate_limiting.failure_mode,
            },
        )
        .with_observer(Arc::new(FanoutObserver::new(observers))),
    );
    rate_limiter.register_scripts().await?;
    info!("Rate limiter initialized");

    if let Some(path) = &config.rate_limiting.policies_path {
        let policies = load_seed_file(path)?;
        for policy in &policies {
            rate_limiter.create_policy(policy).await?;
        }
        info!(count = policies.len(), "Seed policies loaded");
    }

    if config.store.backend == StoreBackend::Memory {
        warn!("In-memory store does not share quota state between instances");
    }

    let server = HttpServer::new(config.server.socket_addr()?, rate_limiter, metrics);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("ThrottleX Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_current_span(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
