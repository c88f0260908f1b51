//! porter server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use porter_core::config::AppConfig;
use porter_server::{AppState, create_router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// porter - resumable upload session server
#[derive(Parser, Debug)]
#[command(name = "porter-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "PORTER_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,

    /// Override the bind address from the configuration
    #[arg(long, env = "PORTER_BIND")]
    bind: Option<String>,
}

/// Load configuration from the optional TOML file, then `PORTER_` env vars.
fn load_config(args: &Args) -> Result<AppConfig> {
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();

    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::info!(
            config_path = %args.config,
            "No config file found, using defaults and environment"
        );
    }

    let mut config: AppConfig = figment
        .merge(Env::prefixed("PORTER_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("porter v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;

    porter_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = porter_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!("Storage backend initialized");

    let metadata = porter_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let state = AppState::with_storage_linker(config.clone(), storage, metadata);

    let shutdown = CancellationToken::new();
    let reconciler = if config.reconciler.enabled {
        Some(Arc::new(state.reconciler()).spawn(shutdown.clone()))
    } else {
        tracing::info!("Lifecycle reconciler disabled");
        None
    };

    let app = create_router(state);
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    tracing::info!("Listening on {}", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    // Covers the server exiting without a signal.
    shutdown.cancel();
    if let Some(handle) = reconciler
        && let Err(e) = handle.await
    {
        tracing::error!(error = %e, "Reconciler task ended abnormally");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
