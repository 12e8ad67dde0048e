//! Orders a node's pending batches for extraction.
//!
//! Channels with no ER batch come first, by processing order then id. Channels
//! holding an ER batch follow under the same ordering, so a stuck channel never
//! delays a healthy one. Batches inside a channel stay in ascending id order.
//! IG batches are scheduled like any other until their marker is acknowledged.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::batch::{BatchStatus, OutgoingBatch};
use crate::channel_cache::ChannelCache;
use crate::model::{Channel, ChannelId, NodeId};
use crate::store::OutgoingBatchStore;
use crate::Result;

pub struct ChannelScheduler {
    store: Arc<dyn OutgoingBatchStore>,
    channels: Arc<ChannelCache>,
    hostname: String,
    last_extracted: Mutex<HashMap<(NodeId, ChannelId), DateTime<Utc>>>,
}

struct Candidate {
    channel: Channel,
    in_error: bool,
    batches: Vec<OutgoingBatch>,
}

impl ChannelScheduler {
    pub fn new(
        store: Arc<dyn OutgoingBatchStore>,
        channels: Arc<ChannelCache>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            store,
            channels,
            hostname: hostname.into(),
            last_extracted: Mutex::new(HashMap::new()),
        }
    }

    /// Batches eligible for extraction to `node_id` at `now`, in send order.
    pub async fn batches_to_send(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutgoingBatch>> {
        let mut by_channel: BTreeMap<ChannelId, Vec<OutgoingBatch>> = BTreeMap::new();
        for batch in self.store.find_pending(node_id).await? {
            by_channel
                .entry(batch.channel_id.clone())
                .or_default()
                .push(batch);
        }

        let mut candidates = Vec::new();
        for (channel_id, batches) in by_channel {
            if let Some(candidate) = self.candidate(node_id, &channel_id, batches, now).await? {
                candidates.push(candidate);
            }
        }

        candidates.sort_by(|a, b| {
            a.in_error
                .cmp(&b.in_error)
                .then_with(|| a.channel.processing_order.cmp(&b.channel.processing_order))
                .then_with(|| a.channel.channel_id.cmp(&b.channel.channel_id))
        });

        Ok(candidates
            .into_iter()
            .flat_map(|c| c.batches)
            .collect())
    }

    async fn candidate(
        &self,
        node_id: &str,
        channel_id: &str,
        mut batches: Vec<OutgoingBatch>,
        now: DateTime<Utc>,
    ) -> Result<Option<Candidate>> {
        let channel = match self.channels.get(channel_id).await? {
            Some(channel) => channel,
            None => {
                warn!(node_id, channel_id, "Pending batches on unknown channel");
                return Ok(None);
            }
        };
        if !channel.enabled || channel.suspended {
            debug!(node_id, channel_id, "Channel disabled or suspended");
            return Ok(None);
        }

        if let Some(control) = self.channels.node_channel(node_id, channel_id).await? {
            if control.ignored {
                let batches = self.ignore_all(batches).await?;
                return Ok(Some(Candidate {
                    channel,
                    in_error: false,
                    batches,
                }));
            }
            if control.suspended {
                debug!(node_id, channel_id, "Node channel suspended");
                return Ok(None);
            }
            if !control.in_window(now.time()) {
                debug!(node_id, channel_id, "Outside extraction window");
                return Ok(None);
            }
        }

        if channel.extract_period_ms > 0 {
            let last = self
                .last_extracted
                .lock()
                .await
                .get(&(node_id.to_string(), channel_id.to_string()))
                .copied();
            if let Some(last) = last {
                let elapsed = now.signed_duration_since(last).num_milliseconds();
                if elapsed < channel.extract_period_ms as i64 {
                    debug!(node_id, channel_id, elapsed_ms = elapsed, "Extract period not elapsed");
                    return Ok(None);
                }
            }
        }

        let in_error = batches.iter().any(OutgoingBatch::is_in_error);
        batches.truncate(channel.max_batch_to_send.max(1));
        Ok(Some(Candidate {
            channel,
            in_error,
            batches,
        }))
    }

    /// Marks every batch IG; they go out as ignore markers.
    async fn ignore_all(&self, mut batches: Vec<OutgoingBatch>) -> Result<Vec<OutgoingBatch>> {
        for batch in batches.iter_mut() {
            if !batch.transition(BatchStatus::Ignored, &self.hostname)? {
                continue;
            }
            self.store.update(batch).await?;
            info!(
                batch_id = batch.batch_id,
                node_id = %batch.node_id,
                channel_id = %batch.channel_id,
                "Batch ignored by node channel control"
            );
        }
        Ok(batches)
    }

    /// Starts the extract period for (node, channel).
    pub async fn record_extraction(&self, node_id: &str, channel_id: &str, at: DateTime<Utc>) {
        self.last_extracted
            .lock()
            .await
            .insert((node_id.to_string(), channel_id.to_string()), at);
    }
}
