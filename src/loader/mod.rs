//! Applies incoming batches to the target database exactly once in effect.
//!
//! The incoming-batch record keyed by (batch_id, source node) is written
//! before any row is touched. A re-delivered batch whose record says OK or SK
//! is skipped. One whose record says ER, or NE after a crash mid-load, is
//! applied again from its first record. An ignore marker records the batch
//! as resolved without touching the target.

pub mod postgres;
pub mod target;

pub use postgres::PgTarget;
pub use target::{MemoryTarget, TargetDatabase, TargetTransaction};

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::ack::AckMessage;
use crate::batch::{BatchFailure, IncomingBatch, IncomingStatus, InsertOutcome};
use crate::config::LoaderConfig;
use crate::listener::{BatchEvent, BatchObservers};
use crate::model::{BatchId, DataId, EventType};
use crate::store::IncomingBatchStore;
use crate::transport::wire::{BatchFrame, RecordPayload, WireRecord};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded(IncomingBatch),
    /// Already applied; nothing was executed.
    Skipped(IncomingBatch),
    /// A statement failed; the failing position is in `failure`.
    Failed(IncomingBatch),
    /// The source ignored the batch; recorded as resolved, nothing applied.
    Ignored(IncomingBatch),
    /// An earlier batch on the same channel is still in error. Nothing was
    /// recorded and no acknowledgment is due.
    Deferred { batch_id: BatchId, blocked_by: BatchId },
}

impl LoadOutcome {
    /// Acknowledgment owed to the source, if any.
    pub fn ack(&self) -> Option<AckMessage> {
        match self {
            LoadOutcome::Loaded(b) | LoadOutcome::Skipped(b) | LoadOutcome::Ignored(b) => {
                Some(AckMessage::ok(b.batch_id, b.load_millis))
            }
            LoadOutcome::Failed(b) => Some(AckMessage::error(b.batch_id, &b.failure, b.load_millis)),
            LoadOutcome::Deferred { .. } => None,
        }
    }

    pub fn batch(&self) -> Option<&IncomingBatch> {
        match self {
            LoadOutcome::Loaded(b)
            | LoadOutcome::Skipped(b)
            | LoadOutcome::Failed(b)
            | LoadOutcome::Ignored(b) => Some(b),
            LoadOutcome::Deferred { .. } => None,
        }
    }
}

struct ApplyFailure {
    line: Option<u32>,
    data_id: Option<DataId>,
    error: Error,
}

pub struct DataLoader {
    incoming: Arc<dyn IncomingBatchStore>,
    target: Arc<dyn TargetDatabase>,
    config: LoaderConfig,
    hostname: String,
    observers: BatchObservers,
}

impl DataLoader {
    pub fn new(
        incoming: Arc<dyn IncomingBatchStore>,
        target: Arc<dyn TargetDatabase>,
        config: LoaderConfig,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            incoming,
            target,
            config,
            hostname: hostname.into(),
            observers: BatchObservers::default(),
        }
    }

    pub fn with_observers(mut self, observers: BatchObservers) -> Self {
        self.observers = observers;
        self
    }

    /// Loads one batch from `source_node_id`. Safe to call repeatedly for the
    /// same batch. Statement failures are reported as [`LoadOutcome::Failed`];
    /// an `Err` means the incoming store itself was unavailable.
    #[instrument(skip(self, frame), fields(batch_id = frame.batch_id, channel_id = %frame.channel_id))]
    pub async fn load(&self, source_node_id: &str, frame: &BatchFrame) -> Result<LoadOutcome> {
        let started = Instant::now();
        if frame.ignored {
            return self.resolve_ignored(source_node_id, frame).await;
        }

        if self.config.strict_ordering {
            let blocker = self
                .incoming
                .unresolved_predecessor(source_node_id, &frame.channel_id, frame.batch_id)
                .await?;
            if let Some(blocked_by) = blocker {
                warn!(blocked_by, "Batch deferred behind an unresolved earlier batch");
                return Ok(LoadOutcome::Deferred {
                    batch_id: frame.batch_id,
                    blocked_by,
                });
            }
        }

        let mut batch = IncomingBatch::new(
            frame.batch_id,
            source_node_id,
            &frame.channel_id,
            &self.hostname,
        );
        match self.incoming.try_insert(&batch).await? {
            InsertOutcome::Inserted => {}
            InsertOutcome::AlreadyExists(prior)
                if prior.status.is_success() && self.config.skip_duplicate_batches =>
            {
                return self.skip(prior).await;
            }
            InsertOutcome::AlreadyExists(prior) => {
                debug!(prior_status = %prior.status, "Re-applying previously seen batch");
                batch = prior;
                batch.reset_for_retry(&self.hostname);
            }
        }
        batch.byte_count = frame.byte_len();

        let applied = self.apply(source_node_id, frame, &mut batch).await;
        batch.load_millis = started.elapsed().as_millis() as u64;
        batch.last_update_hostname = self.hostname.clone();
        batch.updated_at = Utc::now();

        let outcome = match applied {
            Ok(()) => {
                batch.status = IncomingStatus::Ok;
                info!(
                    statements = batch.statement_count,
                    fallback_inserts = batch.fallback_insert_count,
                    fallback_updates = batch.fallback_update_count,
                    missing_deletes = batch.missing_delete_count,
                    "Batch loaded"
                );
                LoadOutcome::Loaded(batch)
            }
            Err(failure) => {
                batch.status = IncomingStatus::Error;
                batch.failure = failure_details(&failure);
                error!(
                    line = ?failure.line,
                    data_id = ?failure.data_id,
                    error = %failure.error,
                    "Batch failed to load"
                );
                LoadOutcome::Failed(batch)
            }
        };

        if let Some(batch) = outcome.batch() {
            self.incoming.update(batch).await?;
            self.observers.notify(&BatchEvent::Loaded {
                batch_id: batch.batch_id,
                node_id: batch.node_id.clone(),
                status: batch.status,
            });
        }
        Ok(outcome)
    }

    async fn skip(&self, mut prior: IncomingBatch) -> Result<LoadOutcome> {
        prior.status = IncomingStatus::Skipped;
        prior.skip_count += 1;
        prior.last_update_hostname = self.hostname.clone();
        prior.updated_at = Utc::now();
        self.incoming.update(&prior).await?;
        info!(skip_count = prior.skip_count, "Batch already loaded, skipped");
        self.observers.notify(&BatchEvent::Loaded {
            batch_id: prior.batch_id,
            node_id: prior.node_id.clone(),
            status: prior.status,
        });
        Ok(LoadOutcome::Skipped(prior))
    }

    /// Records an ignore marker. A prior ER or NE row becomes OK so later
    /// batches on the channel are no longer held behind it.
    async fn resolve_ignored(
        &self,
        source_node_id: &str,
        frame: &BatchFrame,
    ) -> Result<LoadOutcome> {
        let mut batch = IncomingBatch::new(
            frame.batch_id,
            source_node_id,
            &frame.channel_id,
            &self.hostname,
        );
        if let InsertOutcome::AlreadyExists(prior) = self.incoming.try_insert(&batch).await? {
            batch = prior;
        }
        let prior_status = batch.status;
        if !batch.status.is_success() {
            batch.status = IncomingStatus::Ok;
            batch.failure = BatchFailure::default();
        }
        batch.last_update_hostname = self.hostname.clone();
        batch.updated_at = Utc::now();
        self.incoming.update(&batch).await?;
        info!(%prior_status, "Batch ignored at the source, recorded as resolved");
        self.observers.notify(&BatchEvent::Loaded {
            batch_id: batch.batch_id,
            node_id: batch.node_id.clone(),
            status: batch.status,
        });
        Ok(LoadOutcome::Ignored(batch))
    }

    /// Applies every record in order, committing early every `commit_size`
    /// statements. Stops at the first failing record.
    async fn apply(
        &self,
        source_node_id: &str,
        frame: &BatchFrame,
        batch: &mut IncomingBatch,
    ) -> std::result::Result<(), ApplyFailure> {
        let begin_failed = |error| ApplyFailure {
            line: None,
            data_id: None,
            error,
        };
        let mut tx = self.target.begin().await.map_err(begin_failed)?;
        let mut in_segment = 0usize;

        for (index, record) in frame.records.iter().enumerate() {
            let line = index as u32 + 1;
            if let Err(error) = self.apply_record(tx.as_mut(), record, batch).await {
                if let Err(e) = tx.rollback().await {
                    warn!("Rollback after failed statement also failed: {}", e);
                }
                self.observers.notify(&BatchEvent::RolledBack {
                    batch_id: frame.batch_id,
                    node_id: source_node_id.to_string(),
                    failed_line: Some(line),
                });
                return Err(ApplyFailure {
                    line: Some(line),
                    data_id: Some(record.payload.data_id),
                    error,
                });
            }
            batch.statement_count += 1;
            in_segment += 1;

            let more = index + 1 < frame.records.len();
            if self.config.commit_size > 0 && in_segment >= self.config.commit_size && more {
                tx.commit().await.map_err(|error| ApplyFailure {
                    line: Some(line),
                    data_id: Some(record.payload.data_id),
                    error,
                })?;
                self.committed(frame.batch_id, source_node_id, batch.statement_count);
                debug!(statements = batch.statement_count, "Early commit");
                drop(tx);
                tx = self.target.begin().await.map_err(begin_failed)?;
                in_segment = 0;
            }
        }

        tx.commit().await.map_err(begin_failed)?;
        self.committed(frame.batch_id, source_node_id, batch.statement_count);
        Ok(())
    }

    fn committed(&self, batch_id: BatchId, node_id: &str, statements: u64) {
        self.observers.notify(&BatchEvent::Committed {
            batch_id,
            node_id: node_id.to_string(),
            statements,
        });
    }

    async fn apply_record(
        &self,
        tx: &mut dyn TargetTransaction,
        record: &WireRecord,
        batch: &mut IncomingBatch,
    ) -> Result<()> {
        let table = record.table.as_str();
        let payload = &record.payload;
        match record.event_type {
            EventType::Insert | EventType::Reload => {
                let row = required(payload.data_id, &payload.row, "row")?;
                let pk = key_of(payload, &row)?;
                if !tx.insert(table, &pk, &row).await? {
                    if !self.config.fallback_update {
                        return Err(Error::Statement {
                            sql_state: Some("23505".to_string()),
                            sql_code: None,
                            message: format!("duplicate key in {}", table),
                        });
                    }
                    tx.update(table, &pk, &row).await?;
                    batch.fallback_update_count += 1;
                }
            }
            EventType::Update => {
                let row = required(payload.data_id, &payload.row, "row")?;
                let pk = key_of(payload, &row)?;
                if tx.update(table, &pk, &row).await? == 0 {
                    if !self.config.fallback_insert {
                        return Err(Error::Statement {
                            sql_state: Some("02000".to_string()),
                            sql_code: None,
                            message: format!("no row to update in {}", table),
                        });
                    }
                    tx.insert(table, &pk, &row).await?;
                    batch.fallback_insert_count += 1;
                }
            }
            EventType::Delete => {
                let old = payload.old.as_ref().or(payload.pk.as_ref());
                let old = required(payload.data_id, &old.cloned(), "old")?;
                let pk = key_of(payload, &old)?;
                if tx.delete(table, &pk).await? == 0 {
                    batch.missing_delete_count += 1;
                }
            }
            EventType::Sql => {
                let sql = payload.row.as_deref().ok_or_else(|| Error::InvalidMessage {
                    message: format!("data_id {} has no statement", payload.data_id),
                })?;
                tx.execute_sql(sql).await?;
            }
        }
        Ok(())
    }
}

fn parse(data_id: DataId, text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| Error::InvalidMessage {
        message: format!("data_id {} has an unreadable payload: {}", data_id, e),
    })
}

fn required(data_id: DataId, text: &Option<String>, what: &str) -> Result<Value> {
    match text {
        Some(text) => parse(data_id, text),
        None => Err(Error::InvalidMessage {
            message: format!("data_id {} has no {} image", data_id, what),
        }),
    }
}

/// Primary-key image, falling back to the full row.
fn key_of(payload: &RecordPayload, row: &Value) -> Result<Value> {
    match &payload.pk {
        Some(pk) => parse(payload.data_id, pk),
        None => Ok(row.clone()),
    }
}

fn failure_details(failure: &ApplyFailure) -> BatchFailure {
    let (sql_state, sql_code, message) = match &failure.error {
        Error::Statement {
            sql_state,
            sql_code,
            message,
        } => (sql_state.clone(), *sql_code, message.clone()),
        other => (None, None, other.to_string()),
    };
    BatchFailure {
        failed_data_id: failure.data_id,
        failed_line_number: failure.line,
        sql_state,
        sql_code,
        sql_message: Some(message),
    }
}
