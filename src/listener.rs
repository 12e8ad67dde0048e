//! Observers invoked synchronously at batch state-machine transitions.

use std::fmt;
use std::sync::Arc;

use crate::batch::{BatchStatus, IncomingStatus};
use crate::model::{BatchId, ChannelId, NodeId};

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// An outgoing batch was closed by the router and persisted.
    Routed {
        batch_id: BatchId,
        node_id: NodeId,
        channel_id: ChannelId,
        records: u64,
    },
    /// An outgoing batch was fully written to a transport and marked SE.
    Sent { batch_id: BatchId, node_id: NodeId },
    /// An acknowledgment moved an outgoing batch to OK or ER.
    Acknowledged {
        batch_id: BatchId,
        node_id: NodeId,
        status: BatchStatus,
    },
    /// A target transaction segment committed, including early commits.
    Committed {
        batch_id: BatchId,
        node_id: NodeId,
        statements: u64,
    },
    /// A target transaction segment was rolled back after a failed statement.
    RolledBack {
        batch_id: BatchId,
        node_id: NodeId,
        failed_line: Option<u32>,
    },
    /// An incoming batch reached its recorded outcome.
    Loaded {
        batch_id: BatchId,
        node_id: NodeId,
        status: IncomingStatus,
    },
}

pub type BatchObserver = Arc<dyn Fn(&BatchEvent) + Send + Sync>;

/// Ordered observer list. Observers run inline, in registration order.
#[derive(Clone, Default)]
pub struct BatchObservers {
    observers: Vec<BatchObserver>,
}

impl BatchObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, observer: F)
    where
        F: Fn(&BatchEvent) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
    }

    pub fn notify(&self, event: &BatchEvent) {
        for observer in &self.observers {
            observer(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl fmt::Debug for BatchObservers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchObservers")
            .field("observers", &self.observers.len())
            .finish()
    }
}
