use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::extractor::Extractor;
use super::wire::{FrameReader, FrameWriter, Message, SessionKind};
use crate::ack::AcknowledgeService;
use crate::config::TransportConfig;
use crate::loader::{DataLoader, LoadOutcome};
use crate::model::NodeTopology;
use crate::scheduler::ChannelScheduler;
use crate::{Error, Result};

/// Accepts PUSH, PULL and ACK sessions from registered peers.
pub struct TransportServer {
    topology: Arc<NodeTopology>,
    scheduler: Arc<ChannelScheduler>,
    extractor: Arc<Extractor>,
    acks: Arc<AcknowledgeService>,
    loader: Arc<DataLoader>,
    config: TransportConfig,
}

impl TransportServer {
    pub fn new(
        topology: Arc<NodeTopology>,
        scheduler: Arc<ChannelScheduler>,
        extractor: Arc<Extractor>,
        acks: Arc<AcknowledgeService>,
        loader: Arc<DataLoader>,
        config: TransportConfig,
    ) -> Self {
        Self {
            topology,
            scheduler,
            extractor,
            acks,
            loader,
            config,
        }
    }

    /// Accepts connections until `shutdown` flips. Each session runs in its
    /// own task.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Transport server listening");
        let mut incoming = TcpListenerStream::new(listener);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Transport server stopping");
                    return Ok(());
                }
                next = incoming.next() => match next {
                    Some(Ok(stream)) => {
                        let peer = stream.peer_addr().ok();
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle: {}", e);
                        }
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle(stream).await {
                                warn!(peer = ?peer, error = %e, "Session ended with error");
                            }
                        });
                    }
                    Some(Err(e)) => warn!("Accept failed: {}", e),
                    None => return Ok(()),
                },
            }
        }
    }

    /// Serves one session. Unknown or disabled nodes get `ERROR registration`.
    pub async fn handle<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader::new(read_half, self.config.io_timeout());
        let mut writer = FrameWriter::new(write_half, self.config.io_timeout());

        let (kind, node_id) = match reader.receive().await? {
            Some(Message::Hello { kind, node_id }) => (kind, node_id),
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "session must start with a hello, got {:?}",
                    other
                )));
            }
            None => return Ok(()),
        };

        if !self.topology.is_enabled(&node_id) {
            let message = format!("node {} is not registered or is disabled", node_id);
            warn!(node_id = %node_id, "Rejecting session");
            writer
                .send(&Message::registration_error(message.clone()))
                .await?;
            return Err(Error::Registration { node_id, message });
        }

        debug!(node_id = %node_id, ?kind, "Session opened");
        match kind {
            SessionKind::Push => self.accept_push(&mut reader, &mut writer, &node_id).await,
            SessionKind::Pull => self.serve_pull(&mut writer, &node_id).await,
            SessionKind::Ack => self.accept_acks(&mut reader, &mut writer, &node_id).await,
        }
    }

    async fn accept_push<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        node_id: &str,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            match reader.receive().await? {
                Some(Message::Batch(frame)) => {
                    let outcome = self.loader.load(node_id, &frame).await?;
                    let reply = match (&outcome, outcome.ack()) {
                        (_, Some(ack)) => Message::Ack(ack),
                        (LoadOutcome::Deferred { batch_id, blocked_by }, None) => {
                            Message::deferred_error(format!(
                                "batch {} waits for batch {}",
                                batch_id, blocked_by
                            ))
                        }
                        (other, None) => {
                            return Err(Error::Protocol(format!(
                                "no reply for load outcome {:?}",
                                other
                            )));
                        }
                    };
                    writer.send(&reply).await?;
                }
                Some(Message::End) | None => return Ok(()),
                Some(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in push session: {:?}",
                        other
                    )));
                }
            }
        }
    }

    async fn serve_pull<W>(&self, writer: &mut FrameWriter<W>, node_id: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let batches = self.scheduler.batches_to_send(node_id, Utc::now()).await?;
        let mut extracted = HashSet::new();
        let mut blocked = HashSet::new();
        let mut sent = 0usize;
        for mut batch in batches {
            if blocked.contains(&batch.channel_id) {
                continue;
            }
            if extracted.insert(batch.channel_id.clone()) {
                self.scheduler
                    .record_extraction(node_id, &batch.channel_id, Utc::now())
                    .await;
            }
            match self.extractor.send(writer, &mut batch).await {
                Ok(()) => sent += 1,
                Err(Error::IncompleteBatch { .. }) => {
                    blocked.insert(batch.channel_id.clone());
                }
                Err(e) => return Err(e),
            }
        }
        writer.send(&Message::End).await?;
        info!(node_id, sent, held_back_channels = blocked.len(), "Pull session served");
        Ok(())
    }

    async fn accept_acks<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
        node_id: &str,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut applied = 0usize;
        loop {
            match reader.receive().await? {
                Some(Message::Ack(ack)) => {
                    self.acks.ack(node_id, &ack).await?;
                    applied += 1;
                }
                Some(Message::End) => {
                    writer.send(&Message::Ok).await?;
                    debug!(node_id, applied, "Acknowledgments applied");
                    return Ok(());
                }
                Some(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in ack session: {:?}",
                        other
                    )));
                }
                None => {
                    return Err(Error::Connection(
                        "peer closed the ack session before END".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ack::AckMessage;
    use crate::batch::{BatchStatus, NewBatch, OutgoingBatch};
    use crate::channel_cache::{ChannelCache, StaticChannels};
    use crate::config::LoaderConfig;
    use crate::loader::MemoryTarget;
    use crate::model::{Channel, EventType, Node};
    use crate::store::{MemoryStore, OutgoingBatchStore};
    use crate::transport::wire::ERROR_REGISTRATION;
    use serde_json::json;
    use std::time::Duration;

    const IO: Duration = Duration::from_secs(5);

    fn server(store: Arc<MemoryStore>) -> TransportServer {
        let mut disabled = Node::new("store002");
        disabled.enabled = false;
        let topology = Arc::new(NodeTopology::new(
            "corp",
            vec![Node::new("store001"), disabled],
        ));
        let channels = Arc::new(ChannelCache::new(
            Arc::new(StaticChannels::new(vec![Channel::new("sales", 1, 10)], vec![])),
            Duration::from_secs(60),
        ));
        TransportServer::new(
            topology,
            Arc::new(ChannelScheduler::new(store.clone(), channels, "corp-01")),
            Arc::new(Extractor::new(store.clone(), store.clone(), "corp-01")),
            Arc::new(AcknowledgeService::new(store.clone(), "corp-01")),
            Arc::new(DataLoader::new(
                store,
                Arc::new(MemoryTarget::new()),
                LoaderConfig::default(),
                "corp-01",
            )),
            TransportConfig::default(),
        )
    }

    async fn pending_batch(store: &MemoryStore) -> OutgoingBatch {
        let record = store
            .append(MemoryStore::record(
                "sales",
                "sale",
                EventType::Insert,
                json!({"id": 1}),
                None,
            ))
            .await;
        store
            .create(
                NewBatch {
                    node_id: "store001".into(),
                    channel_id: "sales".into(),
                    status: BatchStatus::New,
                    data_ids: vec![record.data_id],
                    byte_count: 0,
                    router_millis: 0,
                },
                "corp-01",
            )
            .await
            .unwrap()
    }

    fn client(
        stream: tokio::io::DuplexStream,
    ) -> (
        FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    ) {
        let (r, w) = tokio::io::split(stream);
        (FrameReader::new(r, IO), FrameWriter::new(w, IO))
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_nodes_are_rejected() {
        let server = server(Arc::new(MemoryStore::new()));
        for node_id in ["store002", "store999"] {
            let (local, remote) = tokio::io::duplex(4096);
            let (mut reader, mut writer) = client(local);
            writer
                .send(&Message::Hello {
                    kind: SessionKind::Pull,
                    node_id: node_id.into(),
                })
                .await
                .unwrap();

            let result = server.handle(remote).await;

            assert!(matches!(result, Err(Error::Registration { .. })));
            match reader.receive().await.unwrap() {
                Some(Message::Error { kind, .. }) => assert_eq!(kind, ERROR_REGISTRATION),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_pull_session_streams_pending_batches() {
        let store = Arc::new(MemoryStore::new());
        let batch = pending_batch(&store).await;
        let server = server(store.clone());
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (mut reader, mut writer) = client(local);
        writer
            .send(&Message::Hello {
                kind: SessionKind::Pull,
                node_id: "store001".into(),
            })
            .await
            .unwrap();

        server.handle(remote).await.unwrap();

        match reader.receive().await.unwrap() {
            Some(Message::Batch(frame)) => {
                assert_eq!(frame.batch_id, batch.batch_id);
                assert_eq!(frame.records.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(reader.receive().await.unwrap(), Some(Message::End));
        let stored = OutgoingBatchStore::find(store.as_ref(), batch.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, BatchStatus::Sent);
    }

    #[tokio::test]
    async fn test_pull_session_holds_channel_behind_incomplete_batch() {
        let store = Arc::new(MemoryStore::new());
        let broken = store
            .create(
                NewBatch {
                    node_id: "store001".into(),
                    channel_id: "sales".into(),
                    status: BatchStatus::New,
                    data_ids: vec![404],
                    byte_count: 0,
                    router_millis: 0,
                },
                "corp-01",
            )
            .await
            .unwrap();
        let later = pending_batch(&store).await;
        let server = server(store.clone());
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (mut reader, mut writer) = client(local);
        writer
            .send(&Message::Hello {
                kind: SessionKind::Pull,
                node_id: "store001".into(),
            })
            .await
            .unwrap();

        server.handle(remote).await.unwrap();

        assert_eq!(reader.receive().await.unwrap(), Some(Message::End));
        let broken = OutgoingBatchStore::find(store.as_ref(), broken.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(broken.status, BatchStatus::Error);
        let later = OutgoingBatchStore::find(store.as_ref(), later.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(later.status, BatchStatus::New);
    }

    #[tokio::test]
    async fn test_ack_session_applies_and_answers_ok() {
        let store = Arc::new(MemoryStore::new());
        let batch = pending_batch(&store).await;
        store
            .update_status(batch.batch_id, BatchStatus::Sent, "corp-01")
            .await
            .unwrap();
        let server = server(store.clone());
        let (local, remote) = tokio::io::duplex(4096);
        let (mut reader, mut writer) = client(local);
        writer
            .send(&Message::Hello {
                kind: SessionKind::Ack,
                node_id: "store001".into(),
            })
            .await
            .unwrap();
        writer
            .send(&Message::Ack(AckMessage::ok(batch.batch_id, 4)))
            .await
            .unwrap();
        writer.send(&Message::End).await.unwrap();

        server.handle(remote).await.unwrap();

        assert_eq!(reader.receive().await.unwrap(), Some(Message::Ok));
        let stored = OutgoingBatchStore::find(store.as_ref(), batch.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, BatchStatus::Ok);
    }
}
