#![allow(dead_code)]

use chrono::Utc;
use rowsync::ack::AckMessage;
use rowsync::config::{
    CacheConfig, Config, LoaderConfig, NodeConfig, PostgresConfig, RouterConfig, TransportConfig,
};
use rowsync::loader::MemoryTarget;
use rowsync::model::{Channel, ChangeRecord, EventType, Node};
use rowsync::router::TriggerRouter;
use rowsync::store::MemoryStore;
use rowsync::transport::{PullSummary, PushSummary};
use rowsync::{Backends, BatchObservers, SyncNode};
use serde_json::Value;
use std::env;
use std::sync::Arc;

pub const CORP: &str = "corp";
pub const STORE: &str = "store001";

/// Get PostgreSQL settings from TEST_PG_* environment variables
pub fn postgres_config() -> PostgresConfig {
    PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 30,
        table_prefix: format!("test_{}", std::process::id()),
    }
}

pub fn config(node_id: &str, peers: Vec<Node>, channels: Vec<Channel>) -> Config {
    Config {
        node: NodeConfig {
            node_id: node_id.to_string(),
            external_id: None,
            hostname: format!("{}-host", node_id),
            listen_addr: None,
        },
        postgres: postgres_config(),
        router: RouterConfig::default(),
        transport: TransportConfig {
            io_timeout_ms: 5_000,
            connect_timeout_ms: 1_000,
            ack_retries: 3,
            ack_retry_delay_ms: 10,
            ..TransportConfig::default()
        },
        loader: LoaderConfig::default(),
        cache: CacheConfig::default(),
        channels,
        node_channels: vec![],
        peers,
        triggers: vec![],
    }
}

pub fn peer(node_id: &str, push: bool, pull: bool) -> Node {
    let mut node = Node::new(node_id);
    node.push = push;
    node.pull = pull;
    node
}

pub struct TestNode {
    pub node: SyncNode,
    pub store: Arc<MemoryStore>,
    pub target: MemoryTarget,
}

impl TestNode {
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let target = MemoryTarget::new();
        let backends = Backends::in_memory(&config, store.clone(), target.clone());
        Self {
            node: SyncNode::new(config, backends, BatchObservers::new()),
            store,
            target,
        }
    }

    pub fn id(&self) -> String {
        self.node.topology.local_node_id().to_string()
    }

    /// Appends one captured change to this node's log.
    pub async fn capture(
        &self,
        channel: &str,
        event: EventType,
        row: Value,
        tx: Option<&str>,
    ) -> ChangeRecord {
        self.store
            .append(MemoryStore::record(channel, "sale", event, row, tx))
            .await
    }
}

/// The central node pushing to one store that knows it as a peer.
pub fn corp_and_store(channels: Vec<Channel>) -> (TestNode, TestNode) {
    let corp = TestNode::new(config(CORP, vec![peer(STORE, true, false)], channels.clone()));
    let store = TestNode::new(config(STORE, vec![peer(CORP, false, true)], channels));
    (corp, store)
}

pub fn with_triggers(mut config: Config, triggers: Vec<TriggerRouter>) -> Config {
    config.triggers = triggers;
    config
}

/// One PUSH session from `from` to `to` over an in-memory stream.
pub async fn push(from: &TestNode, to: &TestNode) -> rowsync::Result<PushSummary> {
    let target_id = to.id();
    let batches = from
        .node
        .scheduler
        .batches_to_send(&target_id, Utc::now())
        .await?;
    let (client, server) = tokio::io::duplex(256 * 1024);
    let (pushed, _served) = tokio::join!(
        from.node.push.push_over(client, &target_id, batches),
        to.node.server.handle(server)
    );
    pushed
}

/// One PULL session by `puller` from `source`. Returns the summary and the
/// acknowledgments still to be delivered.
pub async fn pull_only(
    puller: &TestNode,
    source: &TestNode,
) -> rowsync::Result<(PullSummary, Vec<AckMessage>)> {
    let mut summary = PullSummary::default();
    let mut acks = Vec::new();
    let (client, server) = tokio::io::duplex(256 * 1024);
    let source_id = source.id();
    let (pulled, served) = tokio::join!(
        puller
            .node
            .pull
            .pull_over(client, &source_id, &mut summary, &mut acks),
        source.node.server.handle(server)
    );
    served?;
    pulled?;
    Ok((summary, acks))
}

pub async fn deliver_acks(
    puller: &TestNode,
    source: &TestNode,
    acks: &[AckMessage],
) -> rowsync::Result<()> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (sent, served) = tokio::join!(
        puller.node.pull.send_acks(client, acks),
        source.node.server.handle(server)
    );
    served?;
    sent
}

/// PULL followed by the ACK session.
pub async fn pull(puller: &TestNode, source: &TestNode) -> rowsync::Result<PullSummary> {
    let (mut summary, acks) = pull_only(puller, source).await?;
    deliver_acks(puller, source, &acks).await?;
    summary.acks_sent = acks.len();
    Ok(summary)
}
