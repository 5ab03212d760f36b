//! Order worker entry point.

use std::sync::Arc;

use order_store::{OrderStore, PostgresOrderStore, StoreError};
use saga::Tracer;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use transport::queues::topology;
use transport::{BrokerExt, RabbitMqTransport};
use worker::{Config, LogFormat, Worker, WorkerError};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .init(),
    }
}

fn install_metrics(config: &Config) -> Result<(), WorkerError> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match config.metrics_addr {
        Some(addr) => {
            builder.with_http_listener(addr).install()?;
            tracing::info!(%addr, "serving Prometheus metrics");
        }
        None => {
            builder.install_recorder()?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env()?;
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    install_metrics(&config)?;

    // 3. Connect to the order store
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(StoreError::from)?;
    let store = Arc::new(PostgresOrderStore::new(pool));

    if config.reset_schema {
        tracing::warn!("resetting order schema, existing orders are dropped");
        store.reset_schema().await?;
    }

    // 4. Connect to the broker and declare the topology
    let broker = Arc::new(RabbitMqTransport::connect_any(&config.amqp_urls).await?);
    broker.declare_all(&topology()).await?;

    // 5. Consume until shutdown
    let worker = Worker::for_orders(
        broker.clone(),
        store,
        Tracer::new(),
        config.handler_options(),
        config.concurrency,
    );
    tracing::info!(queues = ?worker.queues(), concurrency = config.concurrency, "starting worker");

    let result = worker.run(shutdown_signal()).await;

    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "failed to close broker connection");
    }

    match &result {
        Ok(()) => tracing::info!("worker shut down gracefully"),
        Err(e) => tracing::error!(error = %e, "worker stopped with an error"),
    }
    result
}
