//! Routing functions selected per source table.
//!
//! ```toml
//! [[triggers]]
//! table = "sale"
//! router = { type = "column_match", column = "store_id", expected = { type = "node_id" } }
//!
//! [[triggers]]
//! table = "price"
//! router = { type = "lookup_table", column = "region", mappings = { east = ["store001"] } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::model::{ChangeRecord, NodeId, NodeTopology};
use crate::Result;

/// Computes the target nodes of one change record.
pub trait RouteToNodes {
    fn route_to_nodes(
        &self,
        record: &ChangeRecord,
        topology: &NodeTopology,
    ) -> Result<BTreeSet<NodeId>>;
}

/// What a column value is compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnTarget {
    /// The node whose id equals the column value.
    NodeId,
    /// The node whose external id equals the column value.
    ExternalId,
    /// Every target when the column equals a constant.
    Value { value: String },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataRouter {
    /// Every enabled peer.
    #[default]
    Default,
    ColumnMatch {
        column: String,
        expected: ColumnTarget,
    },
    /// Column value mapped to an explicit node list.
    LookupTable {
        column: String,
        mappings: HashMap<String, Vec<NodeId>>,
    },
}

/// Binds a routing function to a source table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRouter {
    pub table: String,
    #[serde(default)]
    pub router: DataRouter,
}

fn column_text(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl RouteToNodes for DataRouter {
    fn route_to_nodes(
        &self,
        record: &ChangeRecord,
        topology: &NodeTopology,
    ) -> Result<BTreeSet<NodeId>> {
        let all_targets =
            || -> BTreeSet<NodeId> { topology.targets().map(|n| n.node_id.clone()).collect() };

        let (column, row) = match self {
            DataRouter::Default => return Ok(all_targets()),
            DataRouter::ColumnMatch { column, .. } | DataRouter::LookupTable { column, .. } => {
                match record.row_values()? {
                    Some(row) => (column, row),
                    None => return Ok(BTreeSet::new()),
                }
            }
        };
        let value = match column_text(&row, column) {
            Some(value) => value,
            None => return Ok(BTreeSet::new()),
        };

        let nodes = match self {
            DataRouter::Default => all_targets(),
            DataRouter::ColumnMatch { expected, .. } => match expected {
                ColumnTarget::NodeId => topology
                    .targets()
                    .filter(|n| n.node_id == value)
                    .map(|n| n.node_id.clone())
                    .collect(),
                ColumnTarget::ExternalId => topology
                    .targets()
                    .filter(|n| n.external_id.as_deref() == Some(value.as_str()))
                    .map(|n| n.node_id.clone())
                    .collect(),
                ColumnTarget::Value { value: constant } if *constant == value => all_targets(),
                ColumnTarget::Value { .. } => BTreeSet::new(),
            },
            DataRouter::LookupTable { mappings, .. } => mappings
                .get(&value)
                .into_iter()
                .flatten()
                .filter(|id| topology.targets().any(|n| &n.node_id == *id))
                .cloned()
                .collect(),
        };
        Ok(nodes)
    }
}

/// Table name to routing function. Tables without an entry use [`DataRouter::Default`].
#[derive(Debug, Clone, Default)]
pub struct RouterRegistry {
    routers: HashMap<String, DataRouter>,
    fallback: DataRouter,
}

impl RouterRegistry {
    pub fn new(triggers: Vec<TriggerRouter>) -> Self {
        Self {
            routers: triggers
                .into_iter()
                .map(|t| (t.table.to_lowercase(), t.router))
                .collect(),
            fallback: DataRouter::Default,
        }
    }

    pub fn for_table(&self, table: &str) -> &DataRouter {
        self.routers
            .get(&table.to_lowercase())
            .unwrap_or(&self.fallback)
    }
}
