use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::model::{Channel, Node, NodeChannelControl, NodeTopology};
use crate::router::TriggerRouter;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub node: NodeConfig,
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub node_channels: Vec<NodeChannelControl>,
    #[serde(default)]
    pub peers: Vec<Node>,
    #[serde(default)]
    pub triggers: Vec<TriggerRouter>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub node_id: String,
    #[serde(default)]
    pub external_id: Option<String>,
    /// Recorded as last_update_hostname on every batch this node touches.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    #[serde(default = "default_route_period_ms")]
    pub period_ms: u64,
    /// Records routed between intermediate commits of batches and watermark.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Records kept buffered ahead of the one being routed; also the size
    /// of each change-log read.
    #[serde(default = "default_lookahead_window")]
    pub lookahead_window: usize,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// How long a missing data id may hold routing back before it is
    /// treated as a rolled-back insert and skipped.
    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    #[serde(default = "default_push_period_ms")]
    pub push_period_ms: u64,
    #[serde(default = "default_pull_period_ms")]
    pub pull_period_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Maximum duration of any single read or write on a session.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_ack_retries")]
    pub ack_retries: usize,
    #[serde(default = "default_ack_retry_delay_ms")]
    pub ack_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoaderConfig {
    /// Statements applied before an early commit; 0 commits once per batch.
    #[serde(default = "default_commit_size")]
    pub commit_size: usize,
    #[serde(default = "default_true")]
    pub skip_duplicate_batches: bool,
    #[serde(default = "default_true")]
    pub strict_ordering: bool,
    /// UPDATE matching no row is applied as INSERT.
    #[serde(default = "default_true")]
    pub fallback_insert: bool,
    /// INSERT hitting an existing row is applied as UPDATE.
    #[serde(default = "default_true")]
    pub fallback_update: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_channel_ttl_secs")]
    pub channel_ttl_secs: u64,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ROWSYNC")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Connection settings for the pipeline tables and the target. Built
    /// field by field so credentials need no URL escaping.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.postgres.host)
            .port(self.postgres.port)
            .dbname(&self.postgres.database)
            .user(&self.postgres.username)
            .password(&self.postgres.password)
            .connect_timeout(Duration::from_secs(self.postgres.connect_timeout_secs));
        pg
    }

    pub fn topology(&self) -> NodeTopology {
        NodeTopology::new(self.node.node_id.clone(), self.peers.clone())
    }
}

impl RouterConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn ack_retry_delay(&self) -> Duration {
        Duration::from_millis(self.ack_retry_delay_ms)
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            period_ms: default_route_period_ms(),
            page_size: default_page_size(),
            lookahead_window: default_lookahead_window(),
            lock_timeout_secs: default_lock_timeout_secs(),
            gap_timeout_ms: default_gap_timeout_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            push_period_ms: default_push_period_ms(),
            pull_period_ms: default_pull_period_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            ack_retries: default_ack_retries(),
            ack_retry_delay_ms: default_ack_retry_delay_ms(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            commit_size: default_commit_size(),
            skip_duplicate_batches: true,
            strict_ordering: true,
            fallback_insert: true,
            fallback_update: true,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            channel_ttl_secs: default_channel_ttl_secs(),
        }
    }
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_table_prefix() -> String {
    "sym".to_string()
}

fn default_route_period_ms() -> u64 {
    10_000
}

fn default_page_size() -> usize {
    1000
}

fn default_lookahead_window() -> usize {
    100
}

fn default_lock_timeout_secs() -> u64 {
    300
}

fn default_gap_timeout_ms() -> u64 {
    60_000
}

fn default_push_period_ms() -> u64 {
    60_000
}

fn default_pull_period_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    90_000
}

fn default_io_timeout_ms() -> u64 {
    7_200_000 // 2h
}

fn default_ack_retries() -> usize {
    5
}

fn default_ack_retry_delay_ms() -> u64 {
    5_000
}

fn default_commit_size() -> usize {
    10_000
}

fn default_channel_ttl_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchAlgorithm;
    use crate::router::DataRouter;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_sample() -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    const SAMPLE: &str = r#"
[node]
node_id = "corp"
hostname = "corp-01"
listen_addr = "0.0.0.0:31415"

[postgres]
host = "localhost"
port = 5432
database = "corp"
username = "sync"
password = "secret"

[loader]
commit_size = 500

[[channels]]
channel_id = "sales"
processing_order = 1
max_batch_size = 3

[[channels]]
channel_id = "inventory"
processing_order = 2
max_batch_size = 100
batch_algorithm = "non_transactional"

[[peers]]
node_id = "store001"
address = "127.0.0.1:31416"
push = true

[[triggers]]
table = "sale"
router = { type = "column_match", column = "store_id", expected = { type = "node_id" } }
"#;

    #[test]
    fn test_load_config_file() {
        let file = write_sample();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.node.node_id, "corp");
        assert_eq!(config.postgres.table_prefix, "sym");
        assert_eq!(config.loader.commit_size, 500);
        assert!(config.loader.skip_duplicate_batches);
        assert_eq!(config.router.page_size, 1000);
        assert_eq!(config.router.gap_timeout(), Duration::from_secs(60));
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].max_batch_to_send, 60);
        assert_eq!(
            config.channels[1].batch_algorithm,
            BatchAlgorithm::NonTransactional
        );
        assert!(config.peers[0].push);
        assert!(matches!(
            config.triggers[0].router,
            DataRouter::ColumnMatch { .. }
        ));
    }

    #[test]
    fn test_pg_config_keeps_reserved_characters() {
        let file = write_sample();
        let mut config = Config::from_file(file.path()).unwrap();
        config.postgres.password = "p@ss/w:rd?".to_string();

        let pg = config.pg_config();

        assert_eq!(pg.get_password(), Some("p@ss/w:rd?".as_bytes()));
        assert_eq!(pg.get_user(), Some("sync"));
        assert_eq!(pg.get_dbname(), Some("corp"));
        assert_eq!(pg.get_ports(), &[5432]);
    }

    #[test]
    fn test_topology_from_config() {
        let file = write_sample();
        let config = Config::from_file(file.path()).unwrap();

        let topology = config.topology();
        assert_eq!(topology.local_node_id(), "corp");
        assert_eq!(topology.push_targets().count(), 1);
    }
}
