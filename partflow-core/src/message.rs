//! An [Event] is one entry of a partition's ordered, append-only log. It is
//! read from the source, handed to the dispatcher exactly in arrival order,
//! and referenced afterwards only through its offset (for checkpointing) and
//! its derived document id (for the idempotent sink write).

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one independently ordered substream of the event source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PartitionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A single event read from one partition. Offsets are monotonically
/// increasing within a partition; there is no ordering across partitions.
/// NOTE: cheap to clone, the payload is a ref-counted [Bytes].
#[derive(Debug, Clone)]
pub struct Event {
    pub partition: PartitionId,
    pub offset: i64,
    pub payload: Bytes,
    /// When the event entered the stream, as reported by the transport.
    pub event_time: DateTime<Utc>,
}

impl Event {
    pub fn new(partition: impl Into<PartitionId>, offset: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            partition: partition.into(),
            offset,
            payload: payload.into(),
            event_time: Utc::now(),
        }
    }

    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = event_time;
        self
    }
}
