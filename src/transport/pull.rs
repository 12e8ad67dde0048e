use futures::future::join_all;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, instrument, warn};

use super::wire::{FrameReader, FrameWriter, Message, SessionKind, ERROR_REGISTRATION};
use crate::ack::{send_with_retry, AckMessage};
use crate::config::TransportConfig;
use crate::loader::{DataLoader, LoadOutcome};
use crate::model::{Node, NodeId, NodeTopology};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub received: usize,
    pub loaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deferred: usize,
    pub ignored: usize,
    pub acks_sent: usize,
}

impl PullSummary {
    fn count(&mut self, outcome: &LoadOutcome) {
        match outcome {
            LoadOutcome::Loaded(_) => self.loaded += 1,
            LoadOutcome::Skipped(_) => self.skipped += 1,
            LoadOutcome::Failed(_) => self.failed += 1,
            LoadOutcome::Ignored(_) => self.ignored += 1,
            LoadOutcome::Deferred { .. } => self.deferred += 1,
        }
    }
}

/// Fetches batches from sources, loads them, and returns the acknowledgments
/// on a separate session.
pub struct PullService {
    topology: Arc<NodeTopology>,
    loader: Arc<DataLoader>,
    config: TransportConfig,
}

impl PullService {
    pub fn new(topology: Arc<NodeTopology>, loader: Arc<DataLoader>, config: TransportConfig) -> Self {
        Self {
            topology,
            loader,
            config,
        }
    }

    pub async fn pull_all(&self) -> Vec<(NodeId, Result<PullSummary>)> {
        let pulls = self.topology.pull_sources().map(|node| async move {
            (node.node_id.clone(), self.pull_node(node).await)
        });
        let results = join_all(pulls).await;
        for (node_id, result) in &results {
            if let Err(e) = result {
                warn!(node_id = %node_id, error = %e, "Pull failed");
            }
        }
        results
    }

    /// Pulls from `node`. Acknowledgments for every batch loaded before a
    /// broken stream are still delivered.
    #[instrument(skip(self, node), fields(node_id = %node.node_id))]
    pub async fn pull_node(&self, node: &Node) -> Result<PullSummary> {
        let mut summary = PullSummary::default();
        let mut acks = Vec::new();
        let pulled = match super::connect(node, self.config.connect_timeout()).await {
            Ok(stream) => {
                self.pull_over(stream, &node.node_id, &mut summary, &mut acks)
                    .await
            }
            Err(e) => Err(e),
        };

        if !acks.is_empty() {
            let pending = &acks;
            let timeout = self.config.connect_timeout();
            send_with_retry(
                self.config.ack_retries,
                self.config.ack_retry_delay(),
                move || async move {
                    let stream = super::connect(node, timeout).await?;
                    self.send_acks(stream, pending).await
                },
            )
            .await?;
            summary.acks_sent = acks.len();
        }

        pulled?;
        Ok(summary)
    }

    /// Runs one PULL session, loading each streamed batch until END.
    /// Acknowledgments owed to the source are appended to `acks`.
    pub async fn pull_over<S>(
        &self,
        stream: S,
        source_node_id: &str,
        summary: &mut PullSummary,
        acks: &mut Vec<AckMessage>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, self.config.io_timeout());
        let mut writer = FrameWriter::new(write_half, self.config.io_timeout());
        writer
            .send(&Message::Hello {
                kind: SessionKind::Pull,
                node_id: self.topology.local_node_id().to_string(),
            })
            .await?;

        loop {
            match reader.receive().await? {
                Some(Message::Batch(frame)) => {
                    summary.received += 1;
                    let outcome = self.loader.load(source_node_id, &frame).await?;
                    summary.count(&outcome);
                    if let Some(ack) = outcome.ack() {
                        acks.push(ack);
                    }
                }
                Some(Message::End) => break,
                Some(Message::Error { kind, message }) if kind == ERROR_REGISTRATION => {
                    return Err(Error::Registration {
                        node_id: self.topology.local_node_id().to_string(),
                        message,
                    });
                }
                Some(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in pull session: {:?}",
                        other
                    )));
                }
                None => {
                    return Err(Error::Connection(
                        "source closed the pull session before END".to_string(),
                    ));
                }
            }
        }

        info!(
            received = summary.received,
            loaded = summary.loaded,
            skipped = summary.skipped,
            failed = summary.failed,
            "Pull session complete"
        );
        Ok(())
    }

    /// Runs one ACK session delivering `acks`; succeeds once the source
    /// answers OK.
    pub async fn send_acks<S>(&self, stream: S, acks: &[AckMessage]) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, self.config.io_timeout());
        let mut writer = FrameWriter::new(write_half, self.config.io_timeout());
        writer
            .send(&Message::Hello {
                kind: SessionKind::Ack,
                node_id: self.topology.local_node_id().to_string(),
            })
            .await?;
        for ack in acks {
            writer.send(&Message::Ack(ack.clone())).await?;
        }
        writer.send(&Message::End).await?;

        match reader.receive().await? {
            Some(Message::Ok) => Ok(()),
            Some(Message::Error { kind, message }) if kind == ERROR_REGISTRATION => {
                Err(Error::Registration {
                    node_id: self.topology.local_node_id().to_string(),
                    message,
                })
            }
            Some(other) => Err(Error::Protocol(format!(
                "unexpected reply to acknowledgments: {:?}",
                other
            ))),
            None => Err(Error::Connection(
                "source closed the ack session before OK".to_string(),
            )),
        }
    }
}
