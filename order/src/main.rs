//! Order service binary.

use anyhow::Context;
use souk_broker::{AmqpBroker, QueueConsumer, RedisProcessedStore};
use souk_core::envelope::events;
use souk_order::api::{self, ApiState};
use souk_order::handlers::{
    PaymentFailedHandler, PaymentSucceededHandler, ReservedFailedHandler, ReservedSuccessHandler,
    SagaDeps, SeckillWonHandler,
};
use souk_order::timeout::OrderTimeoutWorker;
use souk_order::{Config, OrderStore};
use souk_outbox::{OutboxRelay, OutboxStore};
use souk_runtime::circuit_breaker::CircuitBreakerConfig;
use souk_runtime::http::{ClientRegistry, ResilientClient};
use std::sync::Arc;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    souk_runtime::telemetry::init_tracing("souk-order");
    let metrics_handle = souk_runtime::telemetry::install_metrics_recorder()
        .map_err(|e| anyhow::anyhow!(e))?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to order database")?;
    souk_order::MIGRATOR
        .run(&pool)
        .await
        .context("running order migrations")?;
    souk_outbox::MIGRATOR
        .run(&pool)
        .await
        .context("running outbox migrations")?;

    let store = OrderStore::new(pool.clone());
    let outbox = OutboxStore::new(pool.clone());
    let deps = SagaDeps::new(store.clone(), outbox.clone());

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

    let timeout_worker = OrderTimeoutWorker::new(
        store.clone(),
        outbox.clone(),
        config.order_timeout,
        config.timeout_scan_interval,
        shutdown.clone(),
    )
    .spawn();

    let consumers = vec![
        QueueConsumer::new(
            broker.clone(),
            events::INVENTORY_RESERVED_SUCCESS,
            Arc::new(ReservedSuccessHandler::new(deps.clone())),
            processed.clone(),
            shutdown.clone(),
        )
        .spawn(),
        QueueConsumer::new(
            broker.clone(),
            events::INVENTORY_RESERVED_FAILED,
            Arc::new(ReservedFailedHandler::new(deps.clone())),
            processed.clone(),
            shutdown.clone(),
        )
        .spawn(),
        QueueConsumer::new(
            broker.clone(),
            events::PAYMENT_SUCCEEDED,
            Arc::new(PaymentSucceededHandler::new(deps.clone())),
            processed.clone(),
            shutdown.clone(),
        )
        .spawn(),
        QueueConsumer::new(
            broker.clone(),
            events::PAYMENT_FAILED,
            Arc::new(PaymentFailedHandler::new(deps.clone())),
            processed.clone(),
            shutdown.clone(),
        )
        .spawn(),
        QueueConsumer::new(
            broker.clone(),
            events::SECKILL_ORDER_WON,
            Arc::new(SeckillWonHandler::new(deps.clone())),
            processed.clone(),
            shutdown.clone(),
        )
        .spawn(),
    ];

    // Product-service client with the environment's breaker overrides.
    let mut breaker_config = CircuitBreakerConfig::default();
    if let Some(pct) = config.cb_error_threshold_pct {
        breaker_config.error_threshold_pct = pct;
    }
    if let Some(reset) = config.cb_reset_timeout {
        breaker_config.reset_timeout = reset;
    }
    let products = ResilientClient::builder()
        .name("product-service")
        .base_url(&config.product_service_url)
        .breaker(breaker_config)
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;
    let registry = ClientRegistry::new();
    registry.register(&products).await;

    let app = api::router(ApiState {
        store,
        outbox,
        products,
        registry,
        metrics: Arc::new(metrics_handle),
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr, "Order service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    let _ = shutdown.send(());
    let _ = relay_handle.await;
    let _ = timeout_worker.await;
    for consumer in consumers {
        let _ = consumer.await;
    }
    tracing::info!("Order service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
