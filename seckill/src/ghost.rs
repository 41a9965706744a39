//! Ghost-order emergency log.
//!
//! When a flash-sale win is reserved in Redis but the `seckill.order.won`
//! publish fails, the buyer already holds the stock, and dropping the event
//! would strand it. The win is appended to a local JSONL file instead (one
//! record per line) and an operator replays the file once the broker is
//! back. Replay reuses the original event identifier, so a record that was
//! in fact published before the crash deduplicates downstream.

use souk_core::bus::{BusError, EventPublisher};
use souk_core::envelope::{DeliveryMetadata, EventEnvelope};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Errors from the ghost log.
#[derive(Error, Debug)]
pub enum GhostLogError {
    /// Filesystem failure.
    #[error("ghost log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record did not encode/decode.
    #[error("ghost log record error: {0}")]
    Record(String),
}

/// One stranded win.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GhostRecord {
    /// Original event identifier (kept for downstream deduplication).
    pub event_id: Uuid,
    /// Correlation identifier of the buy request.
    pub correlation_id: String,
    /// Destination queue.
    pub queue: String,
    /// The envelope that failed to publish.
    pub envelope: EventEnvelope,
}

/// Append-only JSONL log of stranded wins.
#[derive(Clone)]
pub struct GhostLog {
    path: PathBuf,
}

impl GhostLog {
    /// Log at `path` (created on first append).
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Append one record.
    ///
    /// # Errors
    ///
    /// [`GhostLogError::Io`] on filesystem failure,
    /// [`GhostLogError::Record`] when the record does not encode.
    pub async fn append(&self, record: &GhostRecord) -> Result<(), GhostLogError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| GhostLogError::Record(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::warn!(
            event_id = %record.event_id,
            queue = %record.queue,
            path = %self.path.display(),
            "Ghost order written to emergency log"
        );
        metrics::counter!("seckill.ghost_orders").increment(1);
        Ok(())
    }

    /// Replay every logged record through `publisher`. Returns
    /// `(replayed, failed)` counts; failed records stay in the file for
    /// another pass.
    ///
    /// # Errors
    ///
    /// [`GhostLogError::Io`] when the file cannot be read (a missing file
    /// replays zero records).
    pub async fn replay(
        &self,
        publisher: &dyn EventPublisher,
    ) -> Result<(usize, usize), GhostLogError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };

        let mut replayed = 0usize;
        let mut failures = Vec::new();

        for line in content.lines().filter(|line| !line.trim().is_empty()) {
            let record: GhostRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(error = %e, "Skipping corrupt ghost record");
                    continue;
                }
            };

            match self.publish_record(publisher, &record).await {
                Ok(()) => replayed += 1,
                Err(e) => {
                    tracing::warn!(event_id = %record.event_id, error = %e, "Ghost replay failed");
                    failures.push(line.to_string());
                }
            }
        }

        // Rewrite the file with only the records that still failed.
        if failures.is_empty() {
            let _ = tokio::fs::remove_file(&self.path).await;
        } else {
            let mut remaining = failures.join("\n");
            remaining.push('\n');
            tokio::fs::write(&self.path, remaining).await?;
        }

        let failed = failures.len();
        tracing::info!(replayed, failed, "Ghost log replay finished");
        Ok((replayed, failed))
    }

    async fn publish_record(
        &self,
        publisher: &dyn EventPublisher,
        record: &GhostRecord,
    ) -> Result<(), BusError> {
        let metadata = DeliveryMetadata {
            event_id: record.event_id,
            correlation_id: record.correlation_id.clone(),
            timestamp: record.envelope.timestamp,
            headers: HashMap::new(),
        };
        publisher
            .publish(&record.queue, &record.envelope, &metadata)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use souk_core::envelope::events;
    use souk_testing::InMemoryBus;

    fn record(tag: i64) -> GhostRecord {
        GhostRecord {
            event_id: Uuid::new_v4(),
            correlation_id: format!("corr-{tag}"),
            queue: events::SECKILL_ORDER_WON.to_string(),
            envelope: EventEnvelope::new(
                events::SECKILL_ORDER_WON,
                json!({"userId": format!("u-{tag}"), "productId": "p-1", "price": 999, "quantity": 1}),
            ),
        }
    }

    #[tokio::test]
    async fn append_then_replay_round_trips() {
        let dir = std::env::temp_dir().join(format!("ghost-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let log = GhostLog::new(dir.join("ghosts.jsonl"));

        let first = record(1);
        let second = record(2);
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();

        let bus = InMemoryBus::new();
        let (replayed, failed) = log.replay(&bus).await.unwrap();
        assert_eq!((replayed, failed), (2, 0));

        let published = bus.published().await;
        assert_eq!(published.len(), 2);
        // Replay keeps the original event ids so downstream deduplication
        // still works.
        assert_eq!(published[0].metadata.event_id, first.event_id);
        assert_eq!(published[1].metadata.event_id, second.event_id);

        // A clean replay removes the file; a second replay is a no-op.
        let (replayed, failed) = log.replay(&bus).await.unwrap();
        assert_eq!((replayed, failed), (0, 0));
    }

    #[tokio::test]
    async fn failed_replays_stay_in_the_log() {
        let dir = std::env::temp_dir().join(format!("ghost-test-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let log = GhostLog::new(dir.join("ghosts.jsonl"));
        log.append(&record(1)).await.unwrap();

        let bus = InMemoryBus::new();
        bus.set_failing(true).await;
        let (replayed, failed) = log.replay(&bus).await.unwrap();
        assert_eq!((replayed, failed), (0, 1));

        // Broker recovers; the retained record replays.
        bus.set_failing(false).await;
        let (replayed, failed) = log.replay(&bus).await.unwrap();
        assert_eq!((replayed, failed), (1, 0));
    }

    #[tokio::test]
    async fn replay_of_missing_file_is_a_noop() {
        let log = GhostLog::new(
            std::env::temp_dir().join(format!("absent-{}.jsonl", Uuid::new_v4())),
        );
        let bus = InMemoryBus::new();
        assert_eq!(log.replay(&bus).await.unwrap(), (0, 0));
    }
}
