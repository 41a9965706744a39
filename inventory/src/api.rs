//! HTTP surface of the inventory service.
//!
//! Synchronous endpoints used by the product service (record lifecycle) and
//! by operators; the saga itself never calls these, it rides the message
//! plane.

use crate::store::{InventoryError, InventoryStore};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use souk_web::AppError;
use std::sync::Arc;

/// Shared state of the inventory HTTP surface.
#[derive(Clone)]
pub struct ApiState {
    /// Stock store.
    pub store: InventoryStore,
    /// Prometheus render handle.
    pub metrics: Arc<PrometheusHandle>,
}

/// Build the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/inventory", post(create_record))
        .route("/api/inventory/:product_id", get(get_record).delete(delete_record))
        .route("/api/inventory/:product_id/reserve", post(reserve))
        .route("/api/inventory/:product_id/release", post(release))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

fn map_error(err: InventoryError) -> AppError {
    match err {
        InventoryError::InsufficientStock { .. } => {
            AppError::conflict("INSUFFICIENT_STOCK", err.to_string())
        }
        InventoryError::CannotRelease { .. } => {
            AppError::conflict("CANNOT_RELEASE", err.to_string())
        }
        InventoryError::CannotConfirm { .. } => {
            AppError::conflict("CANNOT_CONFIRM", err.to_string())
        }
        InventoryError::NotFound(product_id) => AppError::not_found("Inventory record", product_id),
        InventoryError::InvalidQuantity(_) => AppError::bad_request(err.to_string()),
        InventoryError::Database(_) => {
            AppError::internal("inventory store error").with_source(anyhow::anyhow!(err))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRecordBody {
    product_id: String,
    #[serde(default)]
    available: i64,
}

#[derive(Deserialize)]
struct QuantityBody {
    quantity: i64,
}

async fn create_record(
    State(state): State<ApiState>,
    Json(body): Json<CreateRecordBody>,
) -> Result<(StatusCode, Json<crate::store::InventoryRecord>), AppError> {
    if body.product_id.trim().is_empty() {
        return Err(AppError::bad_request("productId is required"));
    }
    let record = state
        .store
        .create_record(&body.product_id, body.available)
        .await
        .map_err(map_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_record(
    State(state): State<ApiState>,
    Path(product_id): Path<String>,
) -> Result<Json<crate::store::InventoryRecord>, AppError> {
    let record = state.store.get(&product_id).await.map_err(map_error)?;
    Ok(Json(record))
}

async fn delete_record(
    State(state): State<ApiState>,
    Path(product_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .store
        .delete_record(&product_id)
        .await
        .map_err(map_error)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found("Inventory record", product_id))
    }
}

async fn reserve(
    State(state): State<ApiState>,
    Path(product_id): Path<String>,
    Json(body): Json<QuantityBody>,
) -> Result<Json<crate::store::InventoryRecord>, AppError> {
    let record = state
        .store
        .reserve(&product_id, body.quantity)
        .await
        .map_err(map_error)?;
    Ok(Json(record))
}

async fn release(
    State(state): State<ApiState>,
    Path(product_id): Path<String>,
    Json(body): Json<QuantityBody>,
) -> Result<Json<crate::store::InventoryRecord>, AppError> {
    let record = state
        .store
        .release(&product_id, body.quantity)
        .await
        .map_err(map_error)?;
    Ok(Json(record))
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
    fn store_errors_map_to_contract_codes() {
        let err = map_error(InventoryError::InsufficientStock {
            product_id: "p".into(),
            requested: 2,
        });
        assert_eq!(err.code(), "INSUFFICIENT_STOCK");

        let err = map_error(InventoryError::CannotRelease {
            product_id: "p".into(),
            requested: 2,
        });
        assert_eq!(err.code(), "CANNOT_RELEASE");

        let err = map_error(InventoryError::NotFound("p".into()));
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
