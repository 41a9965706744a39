//! HTTP surface of the order service.
//!
//! Order creation is asynchronous past validation: the 201 response carries
//! an order in PENDING, and the final state is reached out-of-band via the
//! saga; clients poll `GET /api/orders/:id`.

use crate::store::{OrderStore, OrderStoreError};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use souk_core::envelope::events;
use souk_core::order::{Order, OrderItem, OrderMetadata, OrderSource, OrderStatus};
use souk_outbox::{NewOutboxEvent, OutboxStore};
use souk_runtime::http::{ClientRegistry, HttpClientError, ResilientClient};
use souk_web::{AppError, UserId};
use std::sync::Arc;
use uuid::Uuid;

/// Shared state of the order HTTP surface.
#[derive(Clone)]
pub struct ApiState {
    /// Order persistence.
    pub store: OrderStore,
    /// Outbox (order creation enqueues `order.created`).
    pub outbox: OutboxStore,
    /// Resilient client for the product service.
    pub products: ResilientClient,
    /// Registry backing `/circuit-breaker/status`.
    pub registry: ClientRegistry,
    /// Prometheus render handle.
    pub metrics: Arc<PrometheusHandle>,
}

/// Build the router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/orders", post(create_order))
        .route("/api/orders/:id", get(get_order))
        .route("/admin/outbox/failed", get(list_failed_outbox))
        .route("/admin/outbox/:event_id/retry", post(retry_outbox))
        .route("/circuit-breaker/status", get(circuit_status))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Product metadata as served by the product service.
#[derive(Debug, Deserialize)]
struct ProductInfo {
    id: String,
    name: String,
    /// Unit price in cents.
    price: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderBody {
    product_ids: Vec<String>,
    quantities: Vec<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderResponse {
    order_id: Uuid,
    status: OrderStatus,
    products: Vec<OrderItem>,
    total_price: i64,
}

fn map_store(err: OrderStoreError) -> AppError {
    AppError::internal("order store error").with_source(anyhow::anyhow!(err))
}

fn map_product_error(err: HttpClientError, product_id: &str) -> AppError {
    match err {
        HttpClientError::Status { status: 404, .. } => AppError::not_found("Product", product_id),
        HttpClientError::CircuitOpen(retry_after) => {
            AppError::unavailable("CIRCUIT_OPEN", retry_after.as_secs().max(1))
        }
        HttpClientError::Timeout => AppError::unavailable("TIMEOUT", 5),
        other => AppError::bad_gateway(format!("product service: {other}")),
    }
}

async fn create_order(
    State(state): State<ApiState>,
    UserId(user_id): UserId,
    Json(body): Json<CreateOrderBody>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), AppError> {
    if body.product_ids.is_empty() {
        return Err(AppError::bad_request("productIds must not be empty"));
    }
    if body.product_ids.len() != body.quantities.len() {
        return Err(AppError::bad_request(
            "productIds and quantities must have the same length",
        ));
    }
    if body.quantities.iter().any(|q| *q <= 0) {
        return Err(AppError::bad_request("quantities must be positive"));
    }

    // Validate every product synchronously before committing anything; the
    // resilient client turns a degraded product service into a 503 the
    // client can retry.
    let mut items = Vec::with_capacity(body.product_ids.len());
    for (product_id, quantity) in body.product_ids.iter().zip(&body.quantities) {
        let product: ProductInfo = state
            .products
            .get_json(&format!("/api/products/{product_id}"))
            .await
            .map_err(|e| map_product_error(e, product_id))?;
        items.push(OrderItem {
            product_id: product.id,
            name: product.name,
            unit_price_cents: product.price,
            quantity: *quantity,
            reserved: false,
        });
    }

    let correlation_id = Uuid::new_v4().to_string();
    let order = Order {
        id: Uuid::new_v4(),
        user_id,
        total_price_cents: items.iter().map(OrderItem::line_total_cents).sum(),
        items,
        status: OrderStatus::Pending,
        cancellation_reason: None,
        metadata: OrderMetadata {
            source: OrderSource::Regular,
            seckill_ref: None,
            correlation_id: Some(correlation_id.clone()),
        },
        created_at: chrono::Utc::now(),
    };

    let created_event = NewOutboxEvent {
        event_id: Uuid::new_v4(),
        event_type: events::ORDER_CREATED.to_string(),
        payload: serde_json::json!({
            "orderId": order.id,
            "products": order.items.iter().map(|item| serde_json::json!({
                "productId": item.product_id,
                "quantity": item.quantity,
            })).collect::<Vec<_>>(),
            "metadata": {"source": "regular"},
        }),
        correlation_id,
        routing_key: None,
    };

    // The atomic dual write: order row and its creation event commit
    // together or not at all.
    let mut tx = state.store.pool().begin().await.map_err(|e| {
        AppError::internal("failed to open transaction").with_source(anyhow::anyhow!(e))
    })?;
    state
        .store
        .insert(&mut tx, &order)
        .await
        .map_err(map_store)?;
    state
        .outbox
        .enqueue(&mut tx, created_event)
        .await
        .map_err(|e| AppError::internal("failed to enqueue event").with_source(anyhow::anyhow!(e)))?;
    tx.commit().await.map_err(|e| {
        AppError::internal("failed to commit order").with_source(anyhow::anyhow!(e))
    })?;

    tracing::info!(order_id = %order.id, user_id = %order.user_id, "Order created");
    metrics::counter!("order.created").increment(1);

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order_id: order.id,
            status: order.status,
            total_price: order.total_price_cents,
            products: order.items,
        }),
    ))
}

async fn get_order(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .store
        .fetch(id)
        .await
        .map_err(map_store)?
        .ok_or_else(|| AppError::not_found("Order", id))?;
    Ok(Json(order))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FailedOutboxEntry {
    event_id: Uuid,
    event_type: String,
    retries: i32,
    last_error: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

async fn list_failed_outbox(
    State(state): State<ApiState>,
) -> Result<Json<Vec<FailedOutboxEntry>>, AppError> {
    let failed = state
        .outbox
        .list_failed(100)
        .await
        .map_err(|e| AppError::internal("outbox query failed").with_source(anyhow::anyhow!(e)))?;
    Ok(Json(
        failed
            .into_iter()
            .map(|event| FailedOutboxEntry {
                event_id: event.event_id,
                event_type: event.event_type,
                retries: event.retries,
                last_error: event.last_error,
                created_at: event.created_at,
            })
            .collect(),
    ))
}

async fn retry_outbox(
    State(state): State<ApiState>,
    Path(event_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let reset = state
        .outbox
        .retry_manually(event_id)
        .await
        .map_err(|e| AppError::internal("outbox update failed").with_source(anyhow::anyhow!(e)))?;
    if reset {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::not_found("Failed outbox event", event_id))
    }
}

async fn circuit_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(state.registry.status().await)
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
    use std::time::Duration;

    #[test]
    fn product_errors_map_to_contract_codes() {
        let err = map_product_error(
            HttpClientError::Status {
                status: 404,
                body: String::new(),
            },
            "p-1",
        );
        assert_eq!(err.code(), "NOT_FOUND");

        let err = map_product_error(HttpClientError::CircuitOpen(Duration::from_secs(12)), "p-1");
        assert_eq!(err.code(), "CIRCUIT_OPEN");

        let err = map_product_error(HttpClientError::Timeout, "p-1");
        assert_eq!(err.code(), "TIMEOUT");

        let err = map_product_error(HttpClientError::Transport("refused".into()), "p-1");
        assert_eq!(err.code(), "BAD_GATEWAY");
    }
}
