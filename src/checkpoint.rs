//! Router progress through the change log.
//!
//! The watermark is the last change-log id the router has fully processed.
//! It is persisted in the same commit as the batches it closed, so a restart
//! resumes from `last_data_id + 1` and either re-derives an uncommitted tail
//! or finds it durable.
//!
//! ```text
//! read 1..=5 → close batch {1,2,3} → commit(batch, watermark=3)
//!                                    (crash here = re-route 4..=5, deterministic)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::DataId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    /// The last change-log id whose routing is durable
    pub last_data_id: DataId,
    /// Number of records routed since the store was created
    pub routed_count: u64,
    /// When this watermark was committed
    pub timestamp: DateTime<Utc>,
}

impl Watermark {
    /// Creates a watermark with the current timestamp.
    pub fn new(last_data_id: DataId, routed_count: u64) -> Self {
        Self {
            last_data_id,
            routed_count,
            timestamp: Utc::now(),
        }
    }

    /// The starting point of an empty change log.
    pub fn origin() -> Self {
        Self::new(0, 0)
    }

    /// Moves forward by `routed` records ending at `last_data_id`.
    /// Never moves backwards.
    pub fn advance(&self, last_data_id: DataId, routed: u64) -> Self {
        if last_data_id <= self.last_data_id {
            return self.clone();
        }
        Self::new(last_data_id, self.routed_count + routed)
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::origin()
    }
}
