//! Core data types shared by the router, extractor and loader.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

pub type NodeId = String;
pub type ChannelId = String;
pub type BatchId = i64;
pub type DataId = i64;

/// Destination recorded for change records that matched no node.
pub const UNROUTED_NODE_ID: &str = "-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
    Reload,
    Sql,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::Reload => "RELOAD",
            EventType::Sql => "SQL",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" | "I" => Ok(EventType::Insert),
            "UPDATE" | "U" => Ok(EventType::Update),
            "DELETE" | "D" => Ok(EventType::Delete),
            "RELOAD" | "R" => Ok(EventType::Reload),
            "SQL" | "S" => Ok(EventType::Sql),
            other => Err(Error::InvalidMessage {
                message: format!("Unknown event type: {}", other),
            }),
        }
    }
}

/// One captured row mutation, read-only once written to the change log.
///
/// Row payloads are JSON objects serialized as text, the way the capture
/// triggers write them. `schema_version` points at the table-shape descriptor
/// that was active at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub data_id: DataId,
    pub channel_id: ChannelId,
    pub table_name: String,
    pub event_type: EventType,
    pub row_data: Option<String>,
    pub old_data: Option<String>,
    pub pk_data: Option<String>,
    pub transaction_id: Option<String>,
    pub schema_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Whether this record closes its source transaction given the record
    /// that follows it in the log. Records without a transaction id are
    /// their own transaction, and the end of the log is always a boundary
    /// because captured rows become visible only when their transaction commits.
    pub fn ends_transaction(&self, next: Option<&ChangeRecord>) -> bool {
        match (&self.transaction_id, next) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(tx), Some(next)) => next.transaction_id.as_deref() != Some(tx.as_str()),
        }
    }

    /// Parsed row image: new values for INSERT/UPDATE/RELOAD, old values for
    /// DELETE. SQL events carry statement text, returned as a JSON string.
    pub fn row_values(&self) -> Result<Option<serde_json::Value>> {
        let raw = match self.event_type {
            EventType::Sql => {
                return Ok(self.row_data.clone().map(serde_json::Value::String));
            }
            EventType::Delete => self.old_data.as_ref().or(self.pk_data.as_ref()),
            _ => self.row_data.as_ref(),
        };
        raw.map(|text| parse_payload(self.data_id, text)).transpose()
    }

    /// Approximate payload size, used for batch byte counters.
    pub fn payload_len(&self) -> u64 {
        [&self.row_data, &self.old_data, &self.pk_data]
            .iter()
            .filter_map(|p| p.as_ref())
            .map(|p| p.len() as u64)
            .sum()
    }
}

fn parse_payload(data_id: DataId, text: &str) -> Result<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| Error::InvalidMessage {
        message: format!("data_id {} has an unreadable payload: {}", data_id, e),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchAlgorithm {
    /// Never split a source transaction across batches.
    #[default]
    Transactional,
    /// Cut at max batch size regardless of transaction boundaries.
    NonTransactional,
}

/// A named lane with independent ordering and flow control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    /// Lower sorts first.
    #[serde(default)]
    pub processing_order: i32,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_to_send")]
    pub max_batch_to_send: usize,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub suspended: bool,
    /// Minimum time between two extractions of this channel for one node.
    #[serde(default)]
    pub extract_period_ms: u64,
    #[serde(default)]
    pub batch_algorithm: BatchAlgorithm,
}

impl Channel {
    pub fn new(channel_id: impl Into<String>, processing_order: i32, max_batch_size: usize) -> Self {
        Self {
            channel_id: channel_id.into(),
            processing_order,
            max_batch_size,
            max_batch_to_send: default_max_batch_to_send(),
            enabled: true,
            suspended: false,
            extract_period_ms: 0,
            batch_algorithm: BatchAlgorithm::Transactional,
        }
    }

    pub fn with_algorithm(mut self, algorithm: BatchAlgorithm) -> Self {
        self.batch_algorithm = algorithm;
        self
    }

    /// Channels that are disabled or suspended take no part in routing.
    pub fn accepts_routing(&self) -> bool {
        self.enabled && !self.suspended
    }
}

/// UTC wall-clock interval during which a node/channel may be extracted.
/// A window whose end precedes its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ExtractWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Per node/channel flow control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChannelControl {
    pub node_id: NodeId,
    pub channel_id: ChannelId,
    /// Batches stay pending and are not extracted.
    #[serde(default)]
    pub suspended: bool,
    /// Pending batches are marked IG and never sent.
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub windows: Vec<ExtractWindow>,
}

impl NodeChannelControl {
    pub fn in_window(&self, time: NaiveTime) -> bool {
        self.windows.is_empty() || self.windows.iter().any(|w| w.contains(time))
    }
}

/// A peer node in the mesh, as provided by node registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    #[serde(default)]
    pub external_id: Option<String>,
    /// host:port of the peer's transport listener.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Batches for this node are pushed by us.
    #[serde(default)]
    pub push: bool,
    /// We pull this node's batches from it.
    #[serde(default)]
    pub pull: bool,
}

impl Node {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            external_id: None,
            address: None,
            enabled: true,
            push: false,
            pull: false,
        }
    }
}

/// The set of peers known to the local node.
#[derive(Debug, Clone, Default)]
pub struct NodeTopology {
    local_node_id: NodeId,
    nodes: Vec<Node>,
}

impl NodeTopology {
    pub fn new(local_node_id: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            nodes,
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn get(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Known and enabled; the only registration fact the pipeline consumes.
    pub fn is_enabled(&self, node_id: &str) -> bool {
        self.get(node_id).map(|n| n.enabled).unwrap_or(false)
    }

    /// Enabled peers that may receive our changes.
    pub fn targets(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(move |n| n.enabled && n.node_id != self.local_node_id)
    }

    pub fn push_targets(&self) -> impl Iterator<Item = &Node> {
        self.targets().filter(|n| n.push)
    }

    pub fn pull_sources(&self) -> impl Iterator<Item = &Node> {
        self.targets().filter(|n| n.pull)
    }
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_batch_to_send() -> usize {
    60
}

fn default_true() -> bool {
    true
}
