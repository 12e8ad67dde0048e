use chrono::Utc;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

use super::extractor::Extractor;
use super::wire::{FrameReader, FrameWriter, Message, SessionKind, ERROR_DEFERRED, ERROR_REGISTRATION};
use crate::ack::{AckResult, AcknowledgeService};
use crate::batch::{BatchStatus, OutgoingBatch};
use crate::config::TransportConfig;
use crate::model::{ChannelId, Node, NodeId, NodeTopology};
use crate::scheduler::ChannelScheduler;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushSummary {
    pub sent: usize,
    pub ok: usize,
    /// Batches that failed on the target, or could not be extracted whole.
    pub failed: usize,
    pub deferred: usize,
    /// Ignore markers the target acknowledged.
    pub ignored: usize,
    /// Not sent because an earlier batch on the same channel failed or was
    /// deferred during this session.
    pub held_back: usize,
}

/// Sends our batches to targets and applies the acknowledgment returned for
/// each one before sending the next.
pub struct PushService {
    topology: Arc<NodeTopology>,
    scheduler: Arc<ChannelScheduler>,
    extractor: Arc<Extractor>,
    acks: Arc<AcknowledgeService>,
    config: TransportConfig,
}

impl PushService {
    pub fn new(
        topology: Arc<NodeTopology>,
        scheduler: Arc<ChannelScheduler>,
        extractor: Arc<Extractor>,
        acks: Arc<AcknowledgeService>,
        config: TransportConfig,
    ) -> Self {
        Self {
            topology,
            scheduler,
            extractor,
            acks,
            config,
        }
    }

    /// Pushes to every push target concurrently. A failing node does not
    /// affect the others.
    pub async fn push_all(&self) -> Vec<(NodeId, Result<PushSummary>)> {
        let pushes = self.topology.push_targets().map(|node| async move {
            (node.node_id.clone(), self.push_node(node).await)
        });
        let results = join_all(pushes).await;
        for (node_id, result) in &results {
            if let Err(e) = result {
                warn!(node_id = %node_id, error = %e, "Push failed, batches left for the next cycle");
            }
        }
        results
    }

    #[instrument(skip(self, node), fields(node_id = %node.node_id))]
    pub async fn push_node(&self, node: &Node) -> Result<PushSummary> {
        let batches = self
            .scheduler
            .batches_to_send(&node.node_id, Utc::now())
            .await?;
        if batches.is_empty() {
            debug!("Nothing to push");
            return Ok(PushSummary::default());
        }
        let stream = super::connect(node, self.config.connect_timeout()).await?;
        self.push_over(stream, &node.node_id, batches).await
    }

    /// Runs one PUSH session on `stream`, sending `batches` in order.
    pub async fn push_over<S>(
        &self,
        stream: S,
        node_id: &str,
        batches: Vec<OutgoingBatch>,
    ) -> Result<PushSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, self.config.io_timeout());
        let mut writer = FrameWriter::new(write_half, self.config.io_timeout());
        writer
            .send(&Message::Hello {
                kind: SessionKind::Push,
                node_id: self.topology.local_node_id().to_string(),
            })
            .await?;

        let mut summary = PushSummary::default();
        let mut extracted: HashSet<ChannelId> = HashSet::new();
        let mut blocked: HashSet<ChannelId> = HashSet::new();

        for mut batch in batches {
            if blocked.contains(&batch.channel_id) {
                summary.held_back += 1;
                continue;
            }
            if extracted.insert(batch.channel_id.clone()) {
                self.scheduler
                    .record_extraction(node_id, &batch.channel_id, Utc::now())
                    .await;
            }
            let marker = batch.status == BatchStatus::Ignored;
            match self.extractor.send(&mut writer, &mut batch).await {
                Ok(()) => summary.sent += 1,
                Err(Error::IncompleteBatch { .. }) => {
                    summary.failed += 1;
                    blocked.insert(batch.channel_id.clone());
                    continue;
                }
                Err(e) => return Err(e),
            }

            match reader.receive().await? {
                Some(Message::Ack(ack)) if ack.batch_id == batch.batch_id => {
                    let result = self.acks.ack(node_id, &ack).await?;
                    if ack.ok && marker {
                        summary.ignored += 1;
                    } else if ack.ok {
                        summary.ok += 1;
                    } else {
                        summary.failed += 1;
                        blocked.insert(batch.channel_id.clone());
                    }
                    debug!(batch_id = batch.batch_id, ?result, "Acknowledgment applied");
                    if result == AckResult::UnknownBatch {
                        warn!(batch_id = batch.batch_id, "Target acknowledged a batch we do not own");
                    }
                }
                Some(Message::Ack(ack)) => {
                    return Err(Error::Protocol(format!(
                        "acknowledgment for batch {} while waiting for {}",
                        ack.batch_id, batch.batch_id
                    )));
                }
                Some(Message::Error { kind, message }) if kind == ERROR_REGISTRATION => {
                    return Err(Error::Registration {
                        node_id: self.topology.local_node_id().to_string(),
                        message,
                    });
                }
                Some(Message::Error { kind, message }) if kind == ERROR_DEFERRED => {
                    info!(batch_id = batch.batch_id, %message, "Target deferred batch");
                    summary.deferred += 1;
                    blocked.insert(batch.channel_id.clone());
                }
                Some(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected reply to batch {}: {:?}",
                        batch.batch_id, other
                    )));
                }
                None => {
                    return Err(Error::Connection(format!(
                        "target closed the session before acknowledging batch {}",
                        batch.batch_id
                    )));
                }
            }
        }

        writer.send(&Message::End).await?;
        info!(
            sent = summary.sent,
            ok = summary.ok,
            failed = summary.failed,
            deferred = summary.deferred,
            ignored = summary.ignored,
            "Push session complete"
        );
        Ok(summary)
    }
}
