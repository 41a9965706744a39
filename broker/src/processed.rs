//! Redis-backed processed-event markers.
//!
//! The marker `processed:{eventId}` is write-once with a 24-hour expiry;
//! its presence means "this event was already handled, skip". Write-once is
//! enforced with `SET NX`, so two racing consumers cannot both claim a
//! fresh marker with different values.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use souk_core::bus::{BusError, ProcessedStore};

/// Marker lifetime: 24 hours.
const MARKER_TTL_SECONDS: u64 = 86_400;

/// Key for an event's marker.
#[must_use]
pub fn marker_key(event_id: &str) -> String {
    format!("processed:{event_id}")
}

/// Redis implementation of [`ProcessedStore`].
#[derive(Clone)]
pub struct RedisProcessedStore {
    connection: ConnectionManager,
}

impl RedisProcessedStore {
    /// Connect to Redis with an auto-reconnecting connection manager.
    ///
    /// # Errors
    ///
    /// [`BusError::MarkerStore`] when the URL is invalid or the initial
    /// connection fails.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::MarkerStore(e.to_string()))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| BusError::MarkerStore(e.to_string()))?;
        Ok(Self { connection })
    }

    /// Wrap an existing connection manager (shared with other Redis users
    /// in the same service).
    #[must_use]
    pub const fn new(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ProcessedStore for RedisProcessedStore {
    async fn is_processed(&self, event_id: &str) -> Result<bool, BusError> {
        let mut connection = self.connection.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(marker_key(event_id))
            .query_async(&mut connection)
            .await
            .map_err(|e| BusError::MarkerStore(e.to_string()))?;
        Ok(exists)
    }

    async fn mark_processed(&self, event_id: &str, handler: &str) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        // NX: never overwrite an existing marker, EX: bounded lifetime.
        let _: Option<String> = redis::cmd("SET")
            .arg(marker_key(event_id))
            .arg(handler)
            .arg("NX")
            .arg("EX")
            .arg(MARKER_TTL_SECONDS)
            .query_async(&mut connection)
            .await
            .map_err(|e| BusError::MarkerStore(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_keys_are_namespaced() {
        assert_eq!(
            marker_key("9c5b94b1-35ad-49bb-b118-8e8fc24abf80"),
            "processed:9c5b94b1-35ad-49bb-b118-8e8fc24abf80"
        );
    }

    #[test]
    fn ttl_is_24_hours() {
        assert_eq!(MARKER_TTL_SECONDS, 24 * 60 * 60);
    }
}
