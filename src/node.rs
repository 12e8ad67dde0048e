//! Wires the pipeline services of one node onto a set of storage backends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::ack::AcknowledgeService;
use crate::batch::{BatchStatus, IncomingBatch, OutgoingBatch};
use crate::channel_cache::{ChannelCache, ChannelSource, ConfigFileChannels, StaticChannels};
use crate::config::Config;
use crate::listener::BatchObservers;
use crate::loader::{DataLoader, MemoryTarget, PgTarget, TargetDatabase};
use crate::model::{BatchId, NodeTopology};
use crate::router::{RouterRegistry, RouterService};
use crate::scheduler::ChannelScheduler;
use crate::store::{
    ChangeLog, ClusterLock, IncomingBatchStore, MemoryStore, OutgoingBatchStore, PgStore,
};
use crate::transport::{Extractor, PullService, PushService, TransportServer};
use crate::Result;

/// Storage the services run on.
#[derive(Clone)]
pub struct Backends {
    pub log: Arc<dyn ChangeLog>,
    pub outgoing: Arc<dyn OutgoingBatchStore>,
    pub incoming: Arc<dyn IncomingBatchStore>,
    pub lock: Arc<dyn ClusterLock>,
    pub target: Arc<dyn TargetDatabase>,
    pub channels: Arc<dyn ChannelSource>,
}

impl Backends {
    /// Everything in one [`MemoryStore`], channels taken from `config`.
    pub fn in_memory(config: &Config, store: Arc<MemoryStore>, target: MemoryTarget) -> Self {
        Self {
            log: store.clone(),
            outgoing: store.clone(),
            incoming: store.clone(),
            lock: store,
            target: Arc::new(target),
            channels: Arc::new(StaticChannels::new(
                config.channels.clone(),
                config.node_channels.clone(),
            )),
        }
    }

    /// PostgreSQL for both the pipeline tables and the target. Channels are
    /// re-read from `config_path` when given.
    pub async fn postgres(config: &Config, config_path: Option<&Path>) -> Result<Self> {
        let pg = config.pg_config();
        let store = Arc::new(PgStore::connect(&pg, &config.postgres.table_prefix).await?);
        store.ensure_schema().await?;
        let target = PgTarget::connect(&pg).await?;
        let channels: Arc<dyn ChannelSource> = match config_path {
            Some(path) => Arc::new(ConfigFileChannels::new(path)),
            None => Arc::new(StaticChannels::new(
                config.channels.clone(),
                config.node_channels.clone(),
            )),
        };
        Ok(Self {
            log: store.clone(),
            outgoing: store.clone(),
            incoming: store.clone(),
            lock: store,
            target: Arc::new(target),
            channels,
        })
    }
}

/// All services of one node, sharing one topology and channel cache.
pub struct SyncNode {
    pub config: Config,
    pub topology: Arc<NodeTopology>,
    pub channels: Arc<ChannelCache>,
    pub outgoing: Arc<dyn OutgoingBatchStore>,
    pub incoming: Arc<dyn IncomingBatchStore>,
    pub router: Arc<RouterService>,
    pub scheduler: Arc<ChannelScheduler>,
    pub acks: Arc<AcknowledgeService>,
    pub loader: Arc<DataLoader>,
    pub push: Arc<PushService>,
    pub pull: Arc<PullService>,
    pub server: Arc<TransportServer>,
}

impl SyncNode {
    pub fn new(config: Config, backends: Backends, observers: BatchObservers) -> Self {
        let hostname = config.node.hostname.clone();
        let topology = Arc::new(config.topology());
        let channels = Arc::new(ChannelCache::new(
            backends.channels.clone(),
            Duration::from_secs(config.cache.channel_ttl_secs),
        ));

        let router = RouterService::new(
            backends.log.clone(),
            backends.outgoing.clone(),
            backends.lock.clone(),
            channels.clone(),
            RouterRegistry::new(config.triggers.clone()),
            topology.clone(),
            config.router.clone(),
            hostname.clone(),
        )
        .with_observers(observers.clone());
        let scheduler = Arc::new(ChannelScheduler::new(
            backends.outgoing.clone(),
            channels.clone(),
            hostname.clone(),
        ));
        let extractor = Arc::new(
            Extractor::new(backends.log.clone(), backends.outgoing.clone(), hostname.clone())
                .with_observers(observers.clone()),
        );
        let acks = Arc::new(
            AcknowledgeService::new(backends.outgoing.clone(), hostname.clone())
                .with_observers(observers.clone()),
        );
        let loader = Arc::new(
            DataLoader::new(
                backends.incoming.clone(),
                backends.target.clone(),
                config.loader.clone(),
                hostname,
            )
            .with_observers(observers),
        );

        let push = PushService::new(
            topology.clone(),
            scheduler.clone(),
            extractor.clone(),
            acks.clone(),
            config.transport.clone(),
        );
        let pull = PullService::new(topology.clone(), loader.clone(), config.transport.clone());
        let server = TransportServer::new(
            topology.clone(),
            scheduler.clone(),
            extractor,
            acks.clone(),
            loader.clone(),
            config.transport.clone(),
        );

        info!(
            node_id = %config.node.node_id,
            peers = config.peers.len(),
            channels = config.channels.len(),
            "Node services ready"
        );
        Self {
            config,
            topology,
            channels,
            outgoing: backends.outgoing,
            incoming: backends.incoming,
            router: Arc::new(router),
            scheduler,
            acks,
            loader,
            push: Arc::new(push),
            pull: Arc::new(pull),
            server: Arc::new(server),
        }
    }

    /// Outgoing and incoming batches currently in ER, newest first.
    pub async fn errors(&self, limit: usize) -> Result<(Vec<OutgoingBatch>, Vec<IncomingBatch>)> {
        let outgoing = self.outgoing.find_errors(limit).await?;
        let incoming = self.incoming.find_errors(limit).await?;
        Ok((outgoing, incoming))
    }

    pub async fn batch(&self, batch_id: BatchId) -> Result<Option<OutgoingBatch>> {
        self.outgoing.find(batch_id).await
    }

    /// Operator override: the batch's rows are never sent. The target gets
    /// one ignore marker so batches after it on the channel can load.
    /// Allowed from NE, SE and ER. `None` when the batch is unknown.
    pub async fn ignore(&self, batch_id: BatchId) -> Result<Option<OutgoingBatch>> {
        let updated = self
            .outgoing
            .update_status(batch_id, BatchStatus::Ignored, &self.config.node.hostname)
            .await?;
        if !updated {
            return Ok(None);
        }
        info!(batch_id, "Batch ignored by operator");
        self.outgoing.find(batch_id).await
    }
}
