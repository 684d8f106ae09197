use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use logger_service::config::{Cli, LoggerConfig, StoreBackend};
use logger_service::routes::{self, AppState};
use logger_service::store::{InMemoryLogStore, RedisLogStore, StoreHandle};
use logger_service::telemetry::init_tracing;
use tokio::sync::Notify;
use topic_bus::RetryPolicy;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = LoggerConfig::try_from(cli)?;
    init_tracing(&config.log_filter)?;

    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        max_entries = config.max_entries,
        "starting logger-service"
    );
    run(config).await
}

async fn build_store(config: &LoggerConfig) -> Result<StoreHandle> {
    match config.store {
        StoreBackend::Memory => Ok(Arc::new(InMemoryLogStore::new(config.max_entries))),
        StoreBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("redis backend selected without a url")?;
            let store = RedisLogStore::connect(
                url,
                config.redis_key.clone(),
                config.max_entries,
                &RetryPolicy::store(),
            )
            .await
            .context("failed to connect to redis")?;
            Ok(Arc::new(store))
        }
    }
}

async fn run(config: LoggerConfig) -> Result<()> {
    let store = build_store(&config).await?;
    let router = routes::router(AppState::new(store));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("logger-service listening on {}", config.listen_addr);

    let stopping = Arc::new(Notify::new());
    let server = axum::serve(listener, router).with_graceful_shutdown({
        let stopping = stopping.clone();
        async move {
            shutdown_signal().await;
            stopping.notify_one();
        }
    });

    let grace = config.shutdown_grace;
    tokio::select! {
        result = server.into_future() => result.context("server shutdown with error")?,
        _ = async {
            stopping.notified().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_seconds = grace.as_secs(), "forcing shutdown after grace period");
        }
    }
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
