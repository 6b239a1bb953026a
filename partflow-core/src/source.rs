//! The event-stream transport, consumed through a narrow interface: open one
//! partition at a position, then pull ordered batches. The engine relies on
//! two transport guarantees only: offsets are monotonically increasing per
//! partition, and a stream opened at a previously committed offset replays
//! everything after it.

use std::time::Duration;

use crate::Result;
use crate::message::{Event, PartitionId};

/// NATS JetStream transport; one stream per partition.
pub mod jetstream;
/// In-memory transport used by tests and local runs.
pub mod memory;

/// Set of items to be implemented to become a Source.
#[trait_variant::make(Source: Send)]
pub trait LocalSource {
    type Stream: SourceStream + Send + 'static;

    /// The set of partitions this source serves. Fixed for the lifetime of
    /// the source.
    fn partitions(&self) -> Vec<PartitionId>;

    /// Opens one partition for reading, starting at `start_offset`. Positions
    /// below the transport's retention floor are clamped to the floor.
    async fn open(&self, partition: &PartitionId, start_offset: i64) -> Result<Self::Stream>;
}

/// An open, exclusively held read position within one partition.
#[trait_variant::make(SourceStream: Send)]
pub trait LocalSourceStream {
    /// Pulls the next batch in strict arrival order, waiting up to `timeout`
    /// for data. An empty batch means the wait elapsed with nothing to read.
    async fn read_batch(&mut self, timeout: Duration) -> Result<Vec<Event>>;
}
