//! Order domain model.
//!
//! The order is the authoritative record of a purchase intent. Its status
//! only ever moves along the saga state machine in [`crate::saga`]; nothing
//! else in the platform may write it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an order.
///
/// `Paid` and `Cancelled` are terminal: once reached, no attribute of the
/// order may change except audit fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created, waiting for inventory reservation.
    Pending,
    /// Inventory reserved, waiting for payment.
    Confirmed,
    /// Payment captured. Terminal.
    Paid,
    /// Rolled back (reservation failure, payment failure, or timeout).
    /// Terminal.
    Cancelled,
}

impl OrderStatus {
    /// Whether the status admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Cancelled)
    }

    /// Database/wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Paid => "PAID",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse the database/wire representation.
    ///
    /// # Errors
    ///
    /// Returns the offending string when it names no known status.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "PAID" => Ok(Self::Paid),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Where an order came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSource {
    /// Ordinary checkout: inventory reserves, then confirms.
    #[default]
    Regular,
    /// Flash sale: stock was already taken from the campaign pool, inventory
    /// performs a blind decrement instead of reserve/confirm.
    Seckill,
}

impl OrderSource {
    /// Database/wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Seckill => "seckill",
        }
    }
}

/// One ordered line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    /// Product identifier.
    pub product_id: String,
    /// Name snapshot taken at order time (product renames do not rewrite
    /// history).
    pub name: String,
    /// Unit price snapshot, in cents.
    pub unit_price_cents: i64,
    /// Ordered quantity.
    pub quantity: i64,
    /// Set once inventory has reserved this line; drives compensation.
    #[serde(default)]
    pub reserved: bool,
}

impl OrderItem {
    /// Line total in cents.
    #[must_use]
    pub const fn line_total_cents(&self) -> i64 {
        self.unit_price_cents * self.quantity
    }
}

/// Order provenance carried through the saga.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMetadata {
    /// Origin of the order.
    #[serde(default)]
    pub source: OrderSource,
    /// Flash-sale reservation identifier, for seckill orders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seckill_ref: Option<String>,
    /// Correlation identifier of the originating request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// The authoritative order record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order identifier.
    pub id: Uuid,
    /// Buyer handle (opaque to this platform; verified at the gateway).
    pub user_id: String,
    /// Ordered lines.
    pub items: Vec<OrderItem>,
    /// Σ(unit price × quantity), in cents.
    pub total_price_cents: i64,
    /// Current saga state.
    pub status: OrderStatus,
    /// Why the order was cancelled, when it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    /// Provenance.
    pub metadata: OrderMetadata,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Recompute the total from the lines. The stored total must always
    /// equal this.
    #[must_use]
    pub fn computed_total_cents(&self) -> i64 {
        self.items.iter().map(OrderItem::line_total_cents).sum()
    }

    /// Lines that currently hold a reservation (compensation scope).
    pub fn reserved_items(&self) -> impl Iterator<Item = &OrderItem> {
        self.items.iter().filter(|item| item.reserved)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn item(product: &str, price: i64, qty: i64, reserved: bool) -> OrderItem {
        OrderItem {
            product_id: product.to_string(),
            name: product.to_uppercase(),
            unit_price_cents: price,
            quantity: qty,
            reserved,
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::Paid,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OrderStatus::parse("SHIPPED").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Paid.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Confirmed.is_terminal());
    }

    #[test]
    fn total_matches_line_sum() {
        let order = Order {
            id: Uuid::new_v4(),
            user_id: "u-1".into(),
            items: vec![item("a", 250, 2, true), item("b", 100, 3, false)],
            total_price_cents: 800,
            status: OrderStatus::Pending,
            cancellation_reason: None,
            metadata: OrderMetadata::default(),
            created_at: Utc::now(),
        };
        assert_eq!(order.computed_total_cents(), 800);
        assert_eq!(order.reserved_items().count(), 1);
    }

    #[test]
    fn metadata_defaults_to_regular_source() {
        let metadata: OrderMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(metadata.source, OrderSource::Regular);

        let metadata: OrderMetadata =
            serde_json::from_str(r#"{"source":"seckill","seckillRef":"r-1"}"#).unwrap();
        assert_eq!(metadata.source, OrderSource::Seckill);
        assert_eq!(metadata.seckill_ref.as_deref(), Some("r-1"));
    }
}
