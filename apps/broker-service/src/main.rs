use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use broker_service::auth::AuthClient;
use broker_service::config::{BrokerConfig, Cli};
use broker_service::routes;
use broker_service::state::AppState;
use broker_service::telemetry::init_tracing;
use clap::Parser;
use tokio::sync::Notify;
use topic_bus::amqp::{redact, AmqpConnector};
use topic_bus::{ConnectionManager, Emitter, ExchangeSpec, RetryPolicy};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = BrokerConfig::try_from(cli)?;
    init_tracing(&config.log_filter)?;

    info!(
        listen_addr = %config.listen_addr,
        broker = %redact(&config.amqp_url),
        exchange = %config.exchange,
        auth_url = %config.auth_url,
        "starting broker-service"
    );
    run(config).await
}

async fn run(config: BrokerConfig) -> Result<()> {
    let connector = AmqpConnector::new(&config.amqp_url);
    let manager = ConnectionManager::new(connector, RetryPolicy::broker());
    let broker = manager.connect().await?;
    let emitter = Emitter::new(broker.clone(), ExchangeSpec::topic(&config.exchange))
        .await
        .context("failed to declare log exchange")?;
    let auth = AuthClient::new(&config.auth_url, config.http_timeout)
        .context("failed to build auth client")?;

    let router = routes::router(AppState::new(emitter, auth));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("broker-service listening on {}", config.listen_addr);

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
            warn!(
                grace_seconds = grace.as_secs(),
                "requests still in flight after grace period; forcing shutdown"
            );
        }
    }

    if let Err(err) = broker.shutdown().await {
        warn!(error = %err, "failed to close broker connection");
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
