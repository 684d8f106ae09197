use anyhow::{Context, Result};
use clap::Parser;
use listener_service::admin;
use listener_service::config::{Cli, ListenerConfig};
use listener_service::telemetry::init_tracing;
use topic_bus::amqp::{redact, AmqpConnector};
use topic_bus::{
    ConnectionManager, ExchangeSpec, Listener, LogSinkClient, LogSinkHandler, RetryPolicy,
    SinkConfig,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ListenerConfig::try_from(cli)?;
    init_tracing(&config.log_filter)?;

    info!(
        broker = %redact(&config.amqp_url),
        exchange = %config.exchange,
        topics = ?config.topics,
        logger_url = %config.logger_url,
        max_in_flight = ?config.max_in_flight,
        "starting listener-service"
    );
    run(config).await
}

async fn run(config: ListenerConfig) -> Result<()> {
    if let Some(addr) = config.metrics_addr {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
        info!("metrics listening on {addr}");
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, admin::router()).await {
                warn!(error = %err, "metrics server stopped");
            }
        });
    }

    let sink = LogSinkClient::new(
        &SinkConfig::new(&config.logger_url).with_timeout(config.sink_timeout),
    )
    .context("failed to build logger client")?;
    info!(endpoint = sink.endpoint(), "forwarding events to logger");

    let connector = AmqpConnector::new(&config.amqp_url);
    let manager = ConnectionManager::new(connector, RetryPolicy::broker());
    let broker = manager.connect().await?;

    let listener = Listener::new(
        broker.clone(),
        ExchangeSpec::topic(&config.exchange),
        LogSinkHandler::new(sink),
    )
    .with_max_in_flight(config.max_in_flight);

    let outcome = listener.listen_until(&config.topics, shutdown_signal()).await;
    if let Err(err) = broker.shutdown().await {
        warn!(error = %err, "failed to close broker connection");
    }
    match outcome {
        Ok(()) => {
            info!("listener stopped");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "listener failed");
            Err(err).context("listener terminated")
        }
    }
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
