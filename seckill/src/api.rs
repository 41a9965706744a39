//! HTTP surface of the flash-sale service.

use crate::engine::{CampaignSpec, ReserveOutcome, SeckillEngine, SeckillError};
use crate::ghost::{GhostLog, GhostRecord};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use souk_core::bus::EventPublisher;
use souk_core::envelope::{events, DeliveryMetadata, EventEnvelope};
use souk_web::{AdminKey, AppError, UserId};
use std::sync::Arc;
use uuid::Uuid;

/// Shared state of the flash-sale HTTP surface.
#[derive(Clone)]
pub struct ApiState {
    /// The reservation engine.
    pub engine: SeckillEngine,
    /// Publisher for `seckill.order.won`.
    pub publisher: Arc<dyn EventPublisher>,
    /// Emergency log for failed publishes.
    pub ghost_log: GhostLog,
    /// Key the admin endpoints require.
    pub admin_key: String,
    /// Prometheus render handle.
    pub metrics: Arc<PrometheusHandle>,
}

/// Build the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/seckill/buy", post(buy))
        .route("/seckill/status/:product_id", get(status))
        .route("/admin/seckill/init", post(init_campaign))
        .route("/admin/seckill/replay-ghosts", post(replay_ghosts))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

fn map_engine(err: SeckillError) -> AppError {
    match err {
        SeckillError::NoCampaign(product_id) => AppError::not_found("Campaign", product_id),
        SeckillError::Store(_) => {
            AppError::internal("flash-sale store error").with_source(anyhow::anyhow!(err))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuyBody {
    product_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuyResponse {
    order_id: String,
}

async fn buy(
    State(state): State<ApiState>,
    UserId(user_id): UserId,
    Json(body): Json<BuyBody>,
) -> Result<(StatusCode, Json<BuyResponse>), AppError> {
    let now = chrono::Utc::now().timestamp();

    let outcome = state
        .engine
        .reserve(&body.product_id, &user_id, now)
        .await
        .map_err(map_engine)?;

    match outcome {
        ReserveOutcome::Won => {}
        ReserveOutcome::RateLimited => return Err(AppError::rate_limited(1)),
        ReserveOutcome::AlreadyPurchased => {
            return Err(AppError::conflict(
                "ALREADY_PURCHASED",
                "this user already won the sale",
            ))
        }
        ReserveOutcome::NotActive => {
            return Err(AppError::conflict("NOT_ACTIVE", "the sale is not active"))
        }
        ReserveOutcome::OutOfStock => {
            return Err(AppError::conflict("OUT_OF_STOCK", "the sale is sold out"))
        }
    }

    metrics::counter!("seckill.wins").increment(1);

    // Price snapshot for the order the win becomes downstream.
    let price = state
        .engine
        .status(&body.product_id, now)
        .await
        .map(|status| status.price)
        .unwrap_or(0);

    let reservation_id = Uuid::new_v4().to_string();
    let metadata = DeliveryMetadata::originate(reservation_id.clone());
    let envelope = EventEnvelope::new(
        events::SECKILL_ORDER_WON,
        serde_json::json!({
            "userId": user_id,
            "productId": body.product_id,
            "price": price,
            "quantity": 1,
            "metadata": {
                "source": "seckill",
                "reservationId": reservation_id,
            },
        }),
    );

    // The win is already durable in Redis; if the broker is down the event
    // goes to the emergency log instead of being dropped, and the buyer
    // still gets their 202.
    if let Err(publish_err) = state
        .publisher
        .publish(events::SECKILL_ORDER_WON, &envelope, &metadata)
        .await
    {
        tracing::error!(
            reservation_id,
            error = %publish_err,
            "Publish of flash-sale win failed, writing ghost order"
        );
        let record = GhostRecord {
            event_id: metadata.event_id,
            correlation_id: metadata.correlation_id.clone(),
            queue: events::SECKILL_ORDER_WON.to_string(),
            envelope,
        };
        state.ghost_log.append(&record).await.map_err(|e| {
            // Redis holds the win but neither the broker nor the disk took
            // the event; surfacing a 500 here is all that is left.
            AppError::internal("failed to persist ghost order").with_source(anyhow::anyhow!(e))
        })?;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(BuyResponse {
            order_id: reservation_id,
        }),
    ))
}

async fn status(
    State(state): State<ApiState>,
    Path(product_id): Path<String>,
) -> Result<Json<crate::engine::CampaignStatus>, AppError> {
    let now = chrono::Utc::now().timestamp();
    let status = state
        .engine
        .status(&product_id, now)
        .await
        .map_err(map_engine)?;
    Ok(Json(status))
}

async fn init_campaign(
    State(state): State<ApiState>,
    AdminKey(key): AdminKey,
    Json(spec): Json<CampaignSpec>,
) -> Result<StatusCode, AppError> {
    if key != state.admin_key {
        return Err(AppError::unauthorized("invalid admin key"));
    }
    if spec.stock < 0 || spec.end <= spec.start {
        return Err(AppError::bad_request("invalid campaign window or stock"));
    }
    state.engine.init_campaign(&spec).await.map_err(map_engine)?;
    Ok(StatusCode::CREATED)
}

#[derive(Serialize)]
struct ReplayResponse {
    replayed: usize,
    failed: usize,
}

async fn replay_ghosts(
    State(state): State<ApiState>,
    AdminKey(key): AdminKey,
) -> Result<Json<ReplayResponse>, AppError> {
    if key != state.admin_key {
        return Err(AppError::unauthorized("invalid admin key"));
    }
    let (replayed, failed) = state
        .ghost_log
        .replay(state.publisher.as_ref())
        .await
        .map_err(|e| AppError::internal("ghost replay failed").with_source(anyhow::anyhow!(e)))?;
    Ok(Json(ReplayResponse { replayed, failed }))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<ApiState>) -> String {
    state.metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_contract_codes() {
        let err = map_engine(SeckillError::NoCampaign("p-1".into()));
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
