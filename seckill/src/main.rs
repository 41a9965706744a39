//! Flash-sale service binary.

use anyhow::Context;
use souk_broker::{AmqpBroker, QueueConsumer, RedisProcessedStore};
use souk_core::envelope::events;
use souk_seckill::api::{self, ApiState};
use souk_seckill::handlers::SeckillReleaseHandler;
use souk_seckill::{Config, GhostLog, SeckillEngine};
use std::sync::Arc;
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();
    souk_runtime::telemetry::init_tracing("souk-seckill");
    let metrics_handle = souk_runtime::telemetry::install_metrics_recorder()
        .map_err(|e| anyhow::anyhow!(e))?;

    if config.rate_limit_disabled {
        tracing::warn!("Flash-sale rate limiting is DISABLED (load-test mode)");
    }

    let engine = SeckillEngine::connect(
        &config.redis_url,
        config.rate_limit,
        config.rate_window_seconds,
        !config.rate_limit_disabled,
    )
    .await
    .map_err(|e| anyhow::anyhow!(e))?;

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

    let consumer = QueueConsumer::new(
        broker.clone(),
        events::SECKILL_RELEASE,
        Arc::new(SeckillReleaseHandler::new(engine.clone())),
        processed,
        shutdown.clone(),
    )
    .spawn();

    let app = api::router(ApiState {
        engine,
        publisher: broker,
        ghost_log: GhostLog::new(&config.ghost_log_path),
        admin_key: config.admin_key.clone(),
        metrics: Arc::new(metrics_handle),
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr, "Flash-sale service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    let _ = shutdown.send(());
    let _ = consumer.await;
    tracing::info!("Flash-sale service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
