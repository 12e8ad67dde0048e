//! In-process backend holding the change log, both batch stores and the
//! router lock behind one mutex, so each trait call is atomic the way a
//! single-row database update is.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{ChangeLog, ClusterLock, IncomingBatchStore, OutgoingBatchStore};
use crate::batch::{
    BatchStatus, IncomingBatch, IncomingStatus, InsertOutcome, NewBatch, OutgoingBatch,
};
use crate::checkpoint::Watermark;
use crate::model::{BatchId, ChangeRecord, DataId, NodeId};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    log: BTreeMap<DataId, ChangeRecord>,
    next_data_id: DataId,
    outgoing: BTreeMap<BatchId, OutgoingBatch>,
    members: HashMap<BatchId, Vec<DataId>>,
    next_batch_id: BatchId,
    watermark: Watermark,
    incoming: BTreeMap<(BatchId, NodeId), IncomingBatch>,
    locks: HashMap<String, (String, Instant)>,
}

impl State {
    fn insert_batch(&mut self, batch: NewBatch, hostname: &str) -> OutgoingBatch {
        self.next_batch_id += 1;
        let batch_id = self.next_batch_id;
        let data_ids = batch.data_ids.clone();
        let outgoing = batch.into_outgoing(batch_id, hostname);
        self.members.insert(batch_id, data_ids);
        self.outgoing.insert(batch_id, outgoing.clone());
        outgoing
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    failing_commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a captured change, assigning the next data id.
    pub async fn append(&self, mut record: ChangeRecord) -> ChangeRecord {
        let mut state = self.state.lock().await;
        state.next_data_id += 1;
        record.data_id = state.next_data_id;
        state.log.insert(record.data_id, record.clone());
        record
    }

    /// Makes the next `count` routing commits fail without persisting
    /// anything, as if the process died before the commit.
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub async fn outgoing_batches(&self) -> Vec<OutgoingBatch> {
        self.state.lock().await.outgoing.values().cloned().collect()
    }

    pub async fn incoming_batches(&self) -> Vec<IncomingBatch> {
        self.state.lock().await.incoming.values().cloned().collect()
    }

    fn take_commit_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChangeLog for MemoryStore {
    async fn read_after(&self, after: DataId, limit: usize) -> Result<Vec<ChangeRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .log
            .range(after + 1..)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn read_ids(&self, data_ids: &[DataId]) -> Result<Vec<ChangeRecord>> {
        let mut ids = data_ids.to_vec();
        ids.sort_unstable();
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.log.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl OutgoingBatchStore for MemoryStore {
    async fn create(&self, batch: NewBatch, hostname: &str) -> Result<OutgoingBatch> {
        let mut state = self.state.lock().await;
        Ok(state.insert_batch(batch, hostname))
    }

    async fn commit_routed(
        &self,
        batches: Vec<NewBatch>,
        watermark: Watermark,
        hostname: &str,
    ) -> Result<Vec<OutgoingBatch>> {
        if self.take_commit_failure() {
            return Err(Error::Connection("routing commit aborted".to_string()));
        }
        let mut state = self.state.lock().await;
        let created: Vec<OutgoingBatch> = batches
            .into_iter()
            .map(|b| state.insert_batch(b, hostname))
            .collect();
        if watermark.last_data_id > state.watermark.last_data_id {
            state.watermark = watermark;
        }
        Ok(created)
    }

    async fn watermark(&self) -> Result<Watermark> {
        Ok(self.state.lock().await.watermark.clone())
    }

    async fn update(&self, batch: &OutgoingBatch) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.outgoing.get_mut(&batch.batch_id) {
            *existing = batch.clone();
        }
        Ok(())
    }

    async fn update_status(
        &self,
        batch_id: BatchId,
        status: BatchStatus,
        hostname: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.outgoing.get_mut(&batch_id) {
            Some(batch) => {
                batch.transition(status, hostname)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find(&self, batch_id: BatchId) -> Result<Option<OutgoingBatch>> {
        Ok(self.state.lock().await.outgoing.get(&batch_id).cloned())
    }

    async fn find_errors(&self, limit: usize) -> Result<Vec<OutgoingBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .outgoing
            .values()
            .rev()
            .filter(|b| b.status == BatchStatus::Error)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_range(&self, start: BatchId, end: BatchId) -> Result<Vec<OutgoingBatch>> {
        if start > end {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        Ok(state
            .outgoing
            .range(start..=end)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn find_pending(&self, node_id: &str) -> Result<Vec<OutgoingBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .outgoing
            .values()
            .filter(|b| b.node_id == node_id && b.awaits_delivery())
            .cloned()
            .collect())
    }

    async fn batch_data_ids(&self, batch_id: BatchId) -> Result<Vec<DataId>> {
        let state = self.state.lock().await;
        Ok(state.members.get(&batch_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl IncomingBatchStore for MemoryStore {
    async fn try_insert(&self, batch: &IncomingBatch) -> Result<InsertOutcome> {
        let mut state = self.state.lock().await;
        let key = (batch.batch_id, batch.node_id.clone());
        if let Some(existing) = state.incoming.get(&key) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        state.incoming.insert(key, batch.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update(&self, batch: &IncomingBatch) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .incoming
            .insert((batch.batch_id, batch.node_id.clone()), batch.clone());
        Ok(())
    }

    async fn find(&self, batch_id: BatchId, node_id: &str) -> Result<Option<IncomingBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .incoming
            .get(&(batch_id, node_id.to_string()))
            .cloned())
    }

    async fn find_errors(&self, limit: usize) -> Result<Vec<IncomingBatch>> {
        let state = self.state.lock().await;
        Ok(state
            .incoming
            .values()
            .rev()
            .filter(|b| b.status == IncomingStatus::Error)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn unresolved_predecessor(
        &self,
        node_id: &str,
        channel_id: &str,
        batch_id: BatchId,
    ) -> Result<Option<BatchId>> {
        let state = self.state.lock().await;
        Ok(state
            .incoming
            .values()
            .filter(|b| {
                b.node_id == node_id
                    && b.channel_id == channel_id
                    && b.batch_id < batch_id
                    && !b.status.is_success()
            })
            .map(|b| b.batch_id)
            .min())
    }
}

#[async_trait]
impl ClusterLock for MemoryStore {
    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let available = match state.locks.get(name) {
            None => true,
            Some((holder, at)) => holder == owner || at.elapsed() >= ttl,
        };
        if available {
            state
                .locks
                .insert(name.to_string(), (owner.to_string(), Instant::now()));
        }
        Ok(available)
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.locks.get(name).map(|(h, _)| h == owner).unwrap_or(false) {
            state.locks.remove(name);
        }
        Ok(())
    }
}

impl MemoryStore {
    /// Builds a record ready for [`MemoryStore::append`].
    pub fn record(
        channel_id: &str,
        table_name: &str,
        event_type: crate::model::EventType,
        row: serde_json::Value,
        transaction_id: Option<&str>,
    ) -> ChangeRecord {
        let pk = row
            .get("id")
            .map(|id| serde_json::json!({ "id": id }).to_string());
        let (row_data, old_data) = match event_type {
            crate::model::EventType::Delete => (None, Some(row.to_string())),
            _ => (Some(row.to_string()), None),
        };
        ChangeRecord {
            data_id: 0,
            channel_id: channel_id.to_string(),
            table_name: table_name.to_string(),
            event_type,
            row_data,
            old_data,
            pk_data: pk,
            transaction_id: transaction_id.map(String::from),
            schema_version: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Takes the next data id without logging a record, like an insert
    /// whose transaction has not committed.
    pub async fn reserve_data_id(&self) -> DataId {
        let mut state = self.state.lock().await;
        state.next_data_id += 1;
        state.next_data_id
    }

    /// Logs `record` under an id taken earlier by `reserve_data_id`.
    pub async fn append_reserved(&self, data_id: DataId, mut record: ChangeRecord) {
        record.data_id = data_id;
        self.state.lock().await.log.insert(data_id, record);
    }
}
