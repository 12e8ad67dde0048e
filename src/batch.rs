//! Outgoing and incoming batch records and their status machines.
//!
//! ```text
//!  NE ──extract──▶ SE ──ack ok──▶ OK
//!                   │
//!                   └──ack err──▶ ER ──resend──▶ SE
//!
//!  NE | SE | ER ──operator──▶ IG
//! ```
//!
//! OK and IG are terminal. Re-applying the current status is a no-op so
//! that repeated updates stay idempotent.
//!
//! An IG batch is still delivered once, as an empty ignore marker, so the
//! target records it as resolved and later batches on the channel can load.
//! `ignore_count` turns nonzero when the target acknowledges the marker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::model::{BatchId, ChannelId, DataId, NodeId};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    #[serde(rename = "NE")]
    New,
    #[serde(rename = "SE")]
    Sent,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ER")]
    Error,
    #[serde(rename = "IG")]
    Ignored,
}

impl BatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::Sent => "SE",
            BatchStatus::Ok => "OK",
            BatchStatus::Error => "ER",
            BatchStatus::Ignored => "IG",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Ok | BatchStatus::Ignored)
    }

    /// Statuses offered again on every extraction pass.
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        if *self == next {
            return true;
        }
        match next {
            BatchStatus::Sent => matches!(self, BatchStatus::New | BatchStatus::Error),
            BatchStatus::Ok | BatchStatus::Error | BatchStatus::Ignored => self.is_pending(),
            BatchStatus::New => false,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "NE" => Ok(BatchStatus::New),
            "SE" => Ok(BatchStatus::Sent),
            "OK" => Ok(BatchStatus::Ok),
            "ER" => Ok(BatchStatus::Error),
            "IG" => Ok(BatchStatus::Ignored),
            other => Err(Error::InvalidMessage {
                message: format!("Unknown outgoing batch status: {}", other),
            }),
        }
    }
}

/// Diagnostic details recorded on a failed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub failed_data_id: Option<DataId>,
    pub failed_line_number: Option<u32>,
    pub sql_state: Option<String>,
    pub sql_code: Option<i32>,
    pub sql_message: Option<String>,
}

/// The unit of delivery to one target node on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub batch_id: BatchId,
    pub node_id: NodeId,
    pub channel_id: ChannelId,
    pub status: BatchStatus,
    pub data_event_count: u64,
    pub byte_count: u64,
    pub extract_count: u32,
    pub sent_count: u32,
    /// Acknowledged ignore markers.
    pub ignore_count: u32,
    pub router_millis: u64,
    pub extract_millis: u64,
    pub network_millis: u64,
    pub load_millis: u64,
    pub failure: BatchFailure,
    pub last_update_hostname: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutgoingBatch {
    /// Moves the batch to `next`, refusing transitions the delivery state
    /// machine does not allow. Returns `false` when the status was already `next`.
    pub fn transition(&mut self, next: BatchStatus, hostname: &str) -> Result<bool> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                batch_id: self.batch_id,
                from: self.status.code().to_string(),
                to: next.code().to_string(),
            });
        }
        self.status = next;
        if next == BatchStatus::Ok {
            self.failure = BatchFailure::default();
        }
        self.touch(hostname);
        Ok(true)
    }

    pub fn touch(&mut self, hostname: &str) {
        self.last_update_hostname = hostname.to_string();
        self.updated_at = Utc::now();
    }

    pub fn is_in_error(&self) -> bool {
        self.status == BatchStatus::Error
    }

    /// Pending batches, plus IG batches whose marker the target has not
    /// acknowledged yet.
    pub fn awaits_delivery(&self) -> bool {
        self.status.is_pending() || (self.status == BatchStatus::Ignored && self.ignore_count == 0)
    }
}

/// A closed accumulator waiting to be persisted as an outgoing batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatch {
    pub node_id: NodeId,
    pub channel_id: ChannelId,
    pub status: BatchStatus,
    pub data_ids: Vec<DataId>,
    pub byte_count: u64,
    pub router_millis: u64,
}

impl NewBatch {
    /// Materializes the persisted row once the store has assigned an id.
    pub fn into_outgoing(self, batch_id: BatchId, hostname: &str) -> OutgoingBatch {
        let now = Utc::now();
        OutgoingBatch {
            batch_id,
            node_id: self.node_id,
            channel_id: self.channel_id,
            status: self.status,
            data_event_count: self.data_ids.len() as u64,
            byte_count: self.byte_count,
            extract_count: 0,
            sent_count: 0,
            ignore_count: 0,
            router_millis: self.router_millis,
            extract_millis: 0,
            network_millis: 0,
            load_millis: 0,
            failure: BatchFailure::default(),
            last_update_hostname: hostname.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncomingStatus {
    /// Recorded and being applied; a crash leaves the batch here.
    #[serde(rename = "NE")]
    New,
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ER")]
    Error,
    #[serde(rename = "SK")]
    Skipped,
}

impl IncomingStatus {
    pub fn code(&self) -> &'static str {
        match self {
            IncomingStatus::New => "NE",
            IncomingStatus::Ok => "OK",
            IncomingStatus::Error => "ER",
            IncomingStatus::Skipped => "SK",
        }
    }

    /// OK and SK both mean the batch's data is already in place.
    pub fn is_success(&self) -> bool {
        matches!(self, IncomingStatus::Ok | IncomingStatus::Skipped)
    }
}

impl fmt::Display for IncomingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for IncomingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "NE" | "LD" => Ok(IncomingStatus::New),
            "OK" => Ok(IncomingStatus::Ok),
            "ER" => Ok(IncomingStatus::Error),
            "SK" => Ok(IncomingStatus::Skipped),
            other => Err(Error::InvalidMessage {
                message: format!("Unknown incoming batch status: {}", other),
            }),
        }
    }
}

/// The receiving node's record of a batch, keyed by (batch_id, node_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingBatch {
    pub batch_id: BatchId,
    pub node_id: NodeId,
    pub channel_id: ChannelId,
    pub status: IncomingStatus,
    pub statement_count: u64,
    pub fallback_insert_count: u64,
    pub fallback_update_count: u64,
    pub missing_delete_count: u64,
    pub byte_count: u64,
    pub load_millis: u64,
    pub skip_count: u32,
    pub retry: bool,
    pub failure: BatchFailure,
    pub last_update_hostname: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IncomingBatch {
    pub fn new(batch_id: BatchId, node_id: &str, channel_id: &str, hostname: &str) -> Self {
        let now = Utc::now();
        Self {
            batch_id,
            node_id: node_id.to_string(),
            channel_id: channel_id.to_string(),
            status: IncomingStatus::New,
            statement_count: 0,
            fallback_insert_count: 0,
            fallback_update_count: 0,
            missing_delete_count: 0,
            byte_count: 0,
            load_millis: 0,
            skip_count: 0,
            retry: false,
            failure: BatchFailure::default(),
            last_update_hostname: hostname.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Clears counters from a previous attempt before re-applying.
    pub fn reset_for_retry(&mut self, hostname: &str) {
        self.status = IncomingStatus::New;
        self.statement_count = 0;
        self.fallback_insert_count = 0;
        self.fallback_update_count = 0;
        self.missing_delete_count = 0;
        self.failure = BatchFailure::default();
        self.retry = true;
        self.last_update_hostname = hostname.to_string();
        self.updated_at = Utc::now();
    }
}

/// Result of the incoming store's conditional insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists(IncomingBatch),
}
