//! Durable state of the pipeline behind `async_trait` seams.
//!
//! Every mutation is a single-row update keyed by batch id, except
//! [`OutgoingBatchStore::commit_routed`], which persists the batches closed by
//! one routing step together with the router watermark.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use std::time::Duration;

use crate::batch::{BatchStatus, IncomingBatch, InsertOutcome, NewBatch, OutgoingBatch};
use crate::checkpoint::Watermark;
use crate::model::{BatchId, ChangeRecord, DataId};
use crate::Result;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Append-only source of captured changes, ordered by id.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Up to `limit` records with `data_id > after`, ascending.
    async fn read_after(&self, after: DataId, limit: usize) -> Result<Vec<ChangeRecord>>;

    /// Records by id, ascending. Missing ids are omitted.
    async fn read_ids(&self, data_ids: &[DataId]) -> Result<Vec<ChangeRecord>>;
}

#[async_trait]
pub trait OutgoingBatchStore: Send + Sync {
    /// Persists one batch and its membership, assigning the next batch id.
    async fn create(&self, batch: NewBatch, hostname: &str) -> Result<OutgoingBatch>;

    /// Persists closed batches (ids assigned in the given order) and the
    /// watermark in one commit.
    async fn commit_routed(
        &self,
        batches: Vec<NewBatch>,
        watermark: Watermark,
        hostname: &str,
    ) -> Result<Vec<OutgoingBatch>>;

    async fn watermark(&self) -> Result<Watermark>;

    /// Writes status, counters and failure details of an existing batch.
    async fn update(&self, batch: &OutgoingBatch) -> Result<()>;

    /// Sets only the status. Returns `false` when the batch is unknown.
    async fn update_status(&self, batch_id: BatchId, status: BatchStatus, hostname: &str)
        -> Result<bool>;

    async fn find(&self, batch_id: BatchId) -> Result<Option<OutgoingBatch>>;

    /// Most recent ER batches first, at most `limit`.
    async fn find_errors(&self, limit: usize) -> Result<Vec<OutgoingBatch>>;

    /// Batches with `start <= batch_id <= end`, ascending.
    async fn find_range(&self, start: BatchId, end: BatchId) -> Result<Vec<OutgoingBatch>>;

    /// NE, SE and ER batches for a node plus IG batches with an
    /// unacknowledged ignore marker, ascending by batch id.
    async fn find_pending(&self, node_id: &str) -> Result<Vec<OutgoingBatch>>;

    /// Member data ids in the order they were routed.
    async fn batch_data_ids(&self, batch_id: BatchId) -> Result<Vec<DataId>>;
}

#[async_trait]
pub trait IncomingBatchStore: Send + Sync {
    /// Inserts unless (batch_id, node_id) is already recorded.
    async fn try_insert(&self, batch: &IncomingBatch) -> Result<InsertOutcome>;

    async fn update(&self, batch: &IncomingBatch) -> Result<()>;

    async fn find(&self, batch_id: BatchId, node_id: &str) -> Result<Option<IncomingBatch>>;

    async fn find_errors(&self, limit: usize) -> Result<Vec<IncomingBatch>>;

    /// Lowest batch from `node_id` on `channel_id` older than `batch_id` that
    /// is not OK or SK. An NE row is a load that never finished.
    async fn unresolved_predecessor(
        &self,
        node_id: &str,
        channel_id: &str,
        batch_id: BatchId,
    ) -> Result<Option<BatchId>>;
}

/// Cluster-wide, time-boxed mutual exclusion.
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Takes the lock if free, held by `owner`, or expired after `ttl`.
    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    async fn unlock(&self, name: &str, owner: &str) -> Result<()>;
}
