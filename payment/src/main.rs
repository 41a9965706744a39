//! Payment service binary.

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use souk_broker::{AmqpBroker, QueueConsumer, RedisProcessedStore};
use souk_core::envelope::events;
use souk_payment::handlers::OrderConfirmedHandler;
use souk_payment::{Config, MockPaymentGateway, PaymentStore};
use souk_outbox::{OutboxRelay, OutboxStore};
use std::sync::Arc;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    souk_runtime::telemetry::init_tracing("souk-payment");
    let metrics_handle = souk_runtime::telemetry::install_metrics_recorder()
        .map_err(|e| anyhow::anyhow!(e))?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to payment database")?;
    souk_payment::MIGRATOR
        .run(&pool)
        .await
        .context("running payment migrations")?;
    souk_outbox::MIGRATOR
        .run(&pool)
        .await
        .context("running outbox migrations")?;

    let store = PaymentStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let gateway = Arc::new(MockPaymentGateway::new(config.decline_marker.clone()));

    let broker = Arc::new(
        AmqpBroker::connect(&config.amqp_url)
            .await
            .map_err(|e| anyhow::anyhow!(e))?,
    );
    let processed: Arc<dyn souk_core::bus::ProcessedStore> = Arc::new(
        RedisProcessedStore::connect(&config.redis_url)
            .await
            .map_err(|e| anyhow::anyhow!(e))?,
    );

    let (shutdown, _) = broadcast::channel(1);

    let relay = OutboxRelay::new(outbox.clone(), broker.clone(), shutdown.clone());
    let relay_handle = relay.spawn();

    let consumer = QueueConsumer::new(
        broker.clone(),
        events::ORDER_CONFIRMED,
        Arc::new(OrderConfirmedHandler::new(store, outbox, gateway)),
        processed,
        shutdown.clone(),
    )
    .spawn();

    let metrics_handle = Arc::new(metrics_handle);
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/metrics",
            get({
                let handle = metrics_handle.clone();
                move || async move { handle.render() }
            }),
        );
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr, "Payment service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    let _ = shutdown.send(());
    let _ = relay_handle.await;
    let _ = consumer.await;
    tracing::info!("Payment service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
