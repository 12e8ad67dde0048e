//! Channel-scoped batch replication between database nodes.
//!
//! Captured changes are routed into per-node, per-channel batches, delivered
//! over push or pull sessions, and applied on the target exactly once in
//! effect. Every component runs against the storage traits in [`store`], with
//! PostgreSQL and in-memory implementations.

pub mod ack;
pub mod batch;
pub mod channel_cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod listener;
pub mod loader;
pub mod model;
pub mod node;
pub mod replicator;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use ack::{AckMessage, AckResult, AcknowledgeService};
pub use batch::{BatchStatus, IncomingBatch, IncomingStatus, OutgoingBatch};
pub use config::Config;
pub use error::{Error, Result};
pub use listener::{BatchEvent, BatchObservers};
pub use loader::{DataLoader, LoadOutcome};
pub use model::{Channel, ChangeRecord, EventType, Node, NodeTopology};
pub use node::{Backends, SyncNode};
pub use replicator::Replicator;
pub use router::{RouteSummary, RouterService};
pub use scheduler::ChannelScheduler;
