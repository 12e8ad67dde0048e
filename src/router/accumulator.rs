use std::collections::BTreeMap;
use std::time::Instant;

use crate::batch::{BatchStatus, NewBatch};
use crate::model::{BatchAlgorithm, ChangeRecord, Channel, ChannelId, DataId, NodeId};

/// Records collected for one (node, channel) until the batch closes.
#[derive(Debug)]
pub(crate) struct BatchAccumulator {
    node_id: NodeId,
    channel_id: ChannelId,
    max_size: usize,
    algorithm: BatchAlgorithm,
    status: BatchStatus,
    data_ids: Vec<DataId>,
    byte_count: u64,
    opened: Instant,
}

impl BatchAccumulator {
    fn new(node_id: &str, channel: &Channel, status: BatchStatus) -> Self {
        Self {
            node_id: node_id.to_string(),
            channel_id: channel.channel_id.clone(),
            max_size: channel.max_batch_size.max(1),
            algorithm: channel.batch_algorithm,
            status,
            data_ids: Vec::new(),
            byte_count: 0,
            opened: Instant::now(),
        }
    }

    fn push(&mut self, record: &ChangeRecord) {
        self.data_ids.push(record.data_id);
        self.byte_count += record.payload_len();
    }

    fn is_full(&self) -> bool {
        self.data_ids.len() >= self.max_size
    }

    /// Full and allowed to close at the current position in the log.
    fn ready(&self, at_boundary: bool) -> bool {
        self.is_full() && (at_boundary || self.algorithm == BatchAlgorithm::NonTransactional)
    }

    fn into_batch(self) -> NewBatch {
        NewBatch {
            node_id: self.node_id,
            channel_id: self.channel_id,
            status: self.status,
            data_ids: self.data_ids,
            byte_count: self.byte_count,
            router_millis: self.opened.elapsed().as_millis() as u64,
        }
    }
}

/// Open accumulators keyed by (node, channel), iterated in key order so
/// batches closed together get ids in a deterministic order.
#[derive(Debug, Default)]
pub(crate) struct Accumulators {
    open: BTreeMap<(NodeId, ChannelId), BatchAccumulator>,
}

impl Accumulators {
    pub fn append(
        &mut self,
        node_id: &str,
        channel: &Channel,
        record: &ChangeRecord,
        status: BatchStatus,
    ) {
        self.open
            .entry((node_id.to_string(), channel.channel_id.clone()))
            .or_insert_with(|| BatchAccumulator::new(node_id, channel, status))
            .push(record);
    }

    /// Removes and returns every accumulator that may close now.
    /// At a transaction boundary all full accumulators close; between
    /// boundaries only non-transactional ones do.
    pub fn close_ready(&mut self, at_boundary: bool) -> Vec<NewBatch> {
        let ready: Vec<_> = self
            .open
            .iter()
            .filter(|(_, acc)| acc.ready(at_boundary))
            .map(|(key, _)| key.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|key| self.open.remove(&key))
            .map(BatchAccumulator::into_batch)
            .collect()
    }

    /// Closes everything still open.
    pub fn flush(&mut self) -> Vec<NewBatch> {
        std::mem::take(&mut self.open)
            .into_values()
            .map(BatchAccumulator::into_batch)
            .collect()
    }

    /// Highest id below every record still held open.
    pub fn safe_watermark(&self, last_read: DataId) -> DataId {
        self.open
            .values()
            .filter_map(|acc| acc.data_ids.first())
            .min()
            .map(|first| first - 1)
            .unwrap_or(last_read)
            .min(last_read)
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn record(data_id: DataId) -> ChangeRecord {
        let mut r = MemoryStore::record("sales", "sale", EventType::Insert, json!({"id": data_id}), None);
        r.data_id = data_id;
        r
    }

    #[test]
    fn test_transactional_waits_for_boundary() {
        let channel = Channel::new("sales", 1, 2);
        let mut accs = Accumulators::default();
        accs.append("store001", &channel, &record(1), BatchStatus::New);
        accs.append("store001", &channel, &record(2), BatchStatus::New);
        assert!(accs.close_ready(false).is_empty());

        accs.append("store001", &channel, &record(3), BatchStatus::New);
        let closed = accs.close_ready(true);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].data_ids, vec![1, 2, 3]);
        assert!(accs.is_empty());
    }

    #[test]
    fn test_non_transactional_cuts_at_size() {
        let channel = Channel::new("inventory", 1, 2).with_algorithm(BatchAlgorithm::NonTransactional);
        let mut accs = Accumulators::default();
        accs.append("store001", &channel, &record(1), BatchStatus::New);
        accs.append("store001", &channel, &record(2), BatchStatus::New);
        assert_eq!(accs.close_ready(false).len(), 1);
    }

    #[test]
    fn test_safe_watermark_stops_before_open_records() {
        let channel = Channel::new("sales", 1, 10);
        let mut accs = Accumulators::default();
        assert_eq!(accs.safe_watermark(9), 9);

        accs.append("store002", &channel, &record(4), BatchStatus::New);
        accs.append("store001", &channel, &record(6), BatchStatus::New);
        assert_eq!(accs.safe_watermark(9), 3);

        let flushed = accs.flush();
        assert_eq!(flushed[0].node_id, "store001");
        assert_eq!(accs.safe_watermark(9), 9);
    }
}
