//! Inventory service binary.

use anyhow::Context;
use souk_broker::{AmqpBroker, QueueConsumer, RedisProcessedStore};
use souk_core::envelope::events;
use souk_inventory::api::{self, ApiState};
use souk_inventory::handlers::{ConfirmHandler, ReleaseHandler, ReservationHandler, TimeoutHandler};
use souk_inventory::{Config, InventoryStore};
use souk_outbox::{OutboxRelay, OutboxStore};
use std::sync::Arc;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    souk_runtime::telemetry::init_tracing("souk-inventory");
    let metrics_handle = souk_runtime::telemetry::install_metrics_recorder()
        .map_err(|e| anyhow::anyhow!(e))?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to inventory database")?;
    souk_inventory::MIGRATOR
        .run(&pool)
        .await
        .context("running inventory migrations")?;
    souk_outbox::MIGRATOR
        .run(&pool)
        .await
        .context("running outbox migrations")?;

    let store = InventoryStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());

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

    let consumers = vec![
        QueueConsumer::new(
            broker.clone(),
            events::ORDER_CREATED,
            Arc::new(ReservationHandler::new(store.clone(), outbox.clone())),
            processed.clone(),
            shutdown.clone(),
        )
        .spawn(),
        QueueConsumer::new(
            broker.clone(),
            events::ORDER_RELEASE,
            Arc::new(ReleaseHandler::new(store.clone())),
            processed.clone(),
            shutdown.clone(),
        )
        .spawn(),
        QueueConsumer::new(
            broker.clone(),
            events::ORDER_CONFIRM,
            Arc::new(ConfirmHandler::new(store.clone())),
            processed.clone(),
            shutdown.clone(),
        )
        .spawn(),
        QueueConsumer::new(
            broker.clone(),
            events::ORDER_TIMEOUT,
            Arc::new(TimeoutHandler::new(store.clone())),
            processed.clone(),
            shutdown.clone(),
        )
        .spawn(),
    ];

    let app = api::router(ApiState {
        store,
        metrics: Arc::new(metrics_handle),
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr, "Inventory service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    // Drain: stop consumers and the relay, then let in-flight handlers
    // finish before the broker connection drops.
    let _ = shutdown.send(());
    let _ = relay_handle.await;
    for consumer in consumers {
        let _ = consumer.await;
    }
    tracing::info!("Inventory service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
