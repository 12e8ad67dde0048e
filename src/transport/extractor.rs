use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWrite;
use tracing::{debug, instrument, warn};

use super::wire::{BatchFrame, FrameWriter, Message, WireRecord};
use crate::batch::{BatchStatus, OutgoingBatch};
use crate::listener::{BatchEvent, BatchObservers};
use crate::store::{ChangeLog, OutgoingBatchStore};
use crate::{Error, Result};

/// Serializes batches from their fixed membership and marks them SE once
/// the whole frame has been written. IG batches go out as ignore markers.
pub struct Extractor {
    log: Arc<dyn ChangeLog>,
    store: Arc<dyn OutgoingBatchStore>,
    hostname: String,
    observers: BatchObservers,
}

impl Extractor {
    pub fn new(
        log: Arc<dyn ChangeLog>,
        store: Arc<dyn OutgoingBatchStore>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            log,
            store,
            hostname: hostname.into(),
            observers: BatchObservers::default(),
        }
    }

    pub fn with_observers(mut self, observers: BatchObservers) -> Self {
        self.observers = observers;
        self
    }

    /// Builds the frame for `batch`. Resending produces the same frame.
    /// Fails with [`Error::IncompleteBatch`] rather than dropping members.
    pub async fn extract(&self, batch: &mut OutgoingBatch) -> Result<BatchFrame> {
        if batch.status == BatchStatus::Ignored {
            return Ok(BatchFrame::ignore_marker(
                batch.batch_id,
                batch.channel_id.clone(),
            ));
        }
        let started = Instant::now();
        let ids = self.store.batch_data_ids(batch.batch_id).await?;
        let records = self.log.read_ids(&ids).await?;
        if records.len() != ids.len() {
            return Err(Error::IncompleteBatch {
                batch_id: batch.batch_id,
                expected: ids.len(),
                found: records.len(),
            });
        }
        batch.extract_count += 1;
        batch.extract_millis = started.elapsed().as_millis() as u64;
        Ok(BatchFrame {
            batch_id: batch.batch_id,
            channel_id: batch.channel_id.clone(),
            ignored: false,
            records: records.iter().map(WireRecord::from).collect(),
        })
    }

    /// Extracts and writes one batch. A write failure leaves the stored status
    /// untouched; only a fully written frame moves the batch to SE.
    #[instrument(skip(self, writer, batch), fields(batch_id = batch.batch_id, node_id = %batch.node_id))]
    pub async fn send<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut FrameWriter<W>,
        batch: &mut OutgoingBatch,
    ) -> Result<()> {
        let frame = match self.extract(batch).await {
            Ok(frame) => frame,
            Err(e @ Error::IncompleteBatch { .. }) => {
                self.mark_incomplete(batch, &e).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let records = frame.records.len();
        let ignored = frame.ignored;
        let started = Instant::now();
        writer.send(&Message::Batch(frame)).await?;

        if !ignored {
            batch.transition(BatchStatus::Sent, &self.hostname)?;
        }
        batch.sent_count += 1;
        batch.network_millis = started.elapsed().as_millis() as u64;
        batch.touch(&self.hostname);
        self.store.update(batch).await?;

        debug!(records, ignored, "Batch sent");
        self.observers.notify(&BatchEvent::Sent {
            batch_id: batch.batch_id,
            node_id: batch.node_id.clone(),
        });
        Ok(())
    }

    async fn mark_incomplete(&self, batch: &mut OutgoingBatch, err: &Error) -> Result<()> {
        batch.transition(BatchStatus::Error, &self.hostname)?;
        batch.failure.sql_message = Some(err.to_string());
        self.store.update(batch).await?;
        warn!(error = %err, "Incomplete batch marked ER; ignoring it releases the channel");
        Ok(())
    }
}
