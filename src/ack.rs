//! Acknowledgment messages and their effect on outgoing batches.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::batch::{BatchFailure, BatchStatus};
use crate::listener::{BatchEvent, BatchObservers};
use crate::model::BatchId;
use crate::store::OutgoingBatchStore;
use crate::Result;

/// Outcome of one batch, sent by the target after it was loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMessage {
    pub batch_id: BatchId,
    pub ok: bool,
    /// 1-based position of the failing record inside the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_message: Option<String>,
    #[serde(default)]
    pub load_millis: u64,
}

impl AckMessage {
    pub fn ok(batch_id: BatchId, load_millis: u64) -> Self {
        Self {
            batch_id,
            ok: true,
            failed_line: None,
            sql_state: None,
            sql_code: None,
            sql_message: None,
            load_millis,
        }
    }

    pub fn error(batch_id: BatchId, failure: &BatchFailure, load_millis: u64) -> Self {
        Self {
            batch_id,
            ok: false,
            failed_line: failure.failed_line_number,
            sql_state: failure.sql_state.clone(),
            sql_code: failure.sql_code,
            sql_message: failure.sql_message.clone(),
            load_millis,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckResult {
    /// The batch moved to the given status. `Applied(Ignored)` means the
    /// target acknowledged an ignore marker.
    Applied(BatchStatus),
    /// The batch was already OK or IG; nothing changed.
    AlreadyAcknowledged,
    /// No batch with that id exists for the acknowledging node.
    UnknownBatch,
}

pub struct AcknowledgeService {
    store: Arc<dyn OutgoingBatchStore>,
    hostname: String,
    observers: BatchObservers,
}

impl AcknowledgeService {
    pub fn new(store: Arc<dyn OutgoingBatchStore>, hostname: impl Into<String>) -> Self {
        Self {
            store,
            hostname: hostname.into(),
            observers: BatchObservers::default(),
        }
    }

    pub fn with_observers(mut self, observers: BatchObservers) -> Self {
        self.observers = observers;
        self
    }

    /// Applies one acknowledgment from `node_id`. Idempotent.
    #[instrument(skip(self, ack), fields(batch_id = ack.batch_id, ok = ack.ok))]
    pub async fn ack(&self, node_id: &str, ack: &AckMessage) -> Result<AckResult> {
        let mut batch = match self.store.find(ack.batch_id).await? {
            Some(batch) if batch.node_id == node_id => batch,
            Some(batch) => {
                warn!(owner = %batch.node_id, "Acknowledgment from a node that does not own the batch");
                return Ok(AckResult::UnknownBatch);
            }
            None => {
                warn!("Acknowledgment for unknown batch");
                return Ok(AckResult::UnknownBatch);
            }
        };
        if batch.status == BatchStatus::Ignored && ack.ok && batch.ignore_count == 0 {
            batch.ignore_count += 1;
            batch.touch(&self.hostname);
            self.store.update(&batch).await?;
            info!(node_id, "Ignore marker acknowledged");
            self.observers.notify(&BatchEvent::Acknowledged {
                batch_id: batch.batch_id,
                node_id: batch.node_id.clone(),
                status: batch.status,
            });
            return Ok(AckResult::Applied(BatchStatus::Ignored));
        }
        if batch.status.is_terminal() {
            debug!(status = %batch.status, "Batch already acknowledged");
            return Ok(AckResult::AlreadyAcknowledged);
        }

        batch.load_millis = ack.load_millis;
        if ack.ok {
            batch.transition(BatchStatus::Ok, &self.hostname)?;
        } else {
            batch.transition(BatchStatus::Error, &self.hostname)?;
            batch.failure = BatchFailure {
                failed_data_id: self.failed_data_id(ack).await?,
                failed_line_number: ack.failed_line,
                sql_state: ack.sql_state.clone(),
                sql_code: ack.sql_code,
                sql_message: ack.sql_message.clone(),
            };
            batch.touch(&self.hostname);
        }
        self.store.update(&batch).await?;

        if ack.ok {
            info!(node_id, "Batch acknowledged");
        } else {
            warn!(
                node_id,
                failed_data_id = ?batch.failure.failed_data_id,
                sql_state = ?batch.failure.sql_state,
                message = ?batch.failure.sql_message,
                "Batch failed on target"
            );
        }
        self.observers.notify(&BatchEvent::Acknowledged {
            batch_id: batch.batch_id,
            node_id: batch.node_id.clone(),
            status: batch.status,
        });
        Ok(AckResult::Applied(batch.status))
    }

    /// Member at the failed position; membership is fixed so this is exact.
    async fn failed_data_id(&self, ack: &AckMessage) -> Result<Option<i64>> {
        let index = match ack.failed_line.and_then(|line| line.checked_sub(1)) {
            Some(index) => index as usize,
            None => return Ok(None),
        };
        let members = self.store.batch_data_ids(ack.batch_id).await?;
        Ok(members.get(index).copied())
    }
}

/// Runs `op` until it succeeds, at most `attempts` times, sleeping `delay`
/// between attempts. Non-retryable errors are returned immediately.
pub async fn send_with_retry<F, Fut, T>(attempts: usize, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && e.is_retryable() => {
                warn!(attempt, attempts, error = %e, "Acknowledgment delivery failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::NewBatch;
    use crate::store::MemoryStore;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn sent_batch(store: &MemoryStore) -> i64 {
        let batch = store
            .create(
                NewBatch {
                    node_id: "store001".into(),
                    channel_id: "sales".into(),
                    status: BatchStatus::New,
                    data_ids: vec![11, 12, 13],
                    byte_count: 0,
                    router_millis: 0,
                },
                "corp-01",
            )
            .await
            .unwrap();
        store
            .update_status(batch.batch_id, BatchStatus::Sent, "corp-01")
            .await
            .unwrap();
        batch.batch_id
    }

    async fn find(store: &MemoryStore, batch_id: i64) -> crate::batch::OutgoingBatch {
        OutgoingBatchStore::find(store, batch_id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_error_ack_records_failed_data_id() {
        let store = Arc::new(MemoryStore::new());
        let batch_id = sent_batch(&store).await;
        let service = AcknowledgeService::new(store.clone(), "corp-01");

        let ack = AckMessage {
            batch_id,
            ok: false,
            failed_line: Some(2),
            sql_state: Some("23505".into()),
            sql_code: None,
            sql_message: Some("duplicate key".into()),
            load_millis: 5,
        };
        let result = service.ack("store001", &ack).await.unwrap();

        assert_eq!(result, AckResult::Applied(BatchStatus::Error));
        let batch = find(&store, batch_id).await;
        assert_eq!(batch.status, BatchStatus::Error);
        assert_eq!(batch.failure.failed_data_id, Some(12));
        assert_eq!(batch.failure.sql_state.as_deref(), Some("23505"));
    }

    #[tokio::test]
    async fn test_ok_ack_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let batch_id = sent_batch(&store).await;
        let service = AcknowledgeService::new(store.clone(), "corp-01");

        let ack = AckMessage::ok(batch_id, 7);
        assert_eq!(
            service.ack("store001", &ack).await.unwrap(),
            AckResult::Applied(BatchStatus::Ok)
        );
        assert_eq!(
            service.ack("store001", &ack).await.unwrap(),
            AckResult::AlreadyAcknowledged
        );
        assert_eq!(find(&store, batch_id).await.load_millis, 7);
    }

    #[tokio::test]
    async fn test_ignore_marker_ack_is_counted_once() {
        let store = Arc::new(MemoryStore::new());
        let batch_id = sent_batch(&store).await;
        store
            .update_status(batch_id, BatchStatus::Ignored, "corp-01")
            .await
            .unwrap();
        let service = AcknowledgeService::new(store.clone(), "corp-01");

        let ack = AckMessage::ok(batch_id, 0);
        assert_eq!(
            service.ack("store001", &ack).await.unwrap(),
            AckResult::Applied(BatchStatus::Ignored)
        );
        assert_eq!(
            service.ack("store001", &ack).await.unwrap(),
            AckResult::AlreadyAcknowledged
        );
        let batch = find(&store, batch_id).await;
        assert_eq!(batch.status, BatchStatus::Ignored);
        assert_eq!(batch.ignore_count, 1);
        assert!(!batch.awaits_delivery());
    }

    #[tokio::test]
    async fn test_unknown_or_foreign_batch_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let batch_id = sent_batch(&store).await;
        let service = AcknowledgeService::new(store.clone(), "corp-01");

        assert_eq!(
            service.ack("store001", &AckMessage::ok(404, 0)).await.unwrap(),
            AckResult::UnknownBatch
        );
        assert_eq!(
            service.ack("store002", &AckMessage::ok(batch_id, 0)).await.unwrap(),
            AckResult::UnknownBatch
        );
        assert_eq!(find(&store, batch_id).await.status, BatchStatus::Sent);
    }

    #[test]
    fn test_ack_json_shape() {
        let json = serde_json::to_value(AckMessage::ok(3, 0)).unwrap();
        assert_eq!(json["batchId"], 3);
        assert!(json.get("failedLine").is_none());
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let value = send_with_retry(3, Duration::from_millis(1), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Connection("refused".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = send_with_retry(2, Duration::from_millis(1), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout {
                message: "ack".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<()> = send_with_retry(5, Duration::from_millis(1), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Registration {
                node_id: "x".into(),
                message: "unknown".into(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
