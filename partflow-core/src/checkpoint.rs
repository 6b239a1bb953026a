//! Durable per-partition progress records, doubling as the coordination
//! substrate for partition ownership. One record per partition holds the last
//! committed offset plus optional lease metadata; the offset survives lease
//! churn and is only ever superseded, never deleted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::message::PartitionId;

/// NATS JetStream KV backed store.
pub mod jetstream;
/// In-memory store used by tests and local runs.
pub mod memory;

/// The durable record kept per partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Last committed offset; `None` until the first commit.
    pub offset: Option<i64>,
    /// Current lease holder, if any.
    pub owner: Option<String>,
    /// Lease expiry; a lease past this instant counts as unowned.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CheckpointRecord {
    /// Whether the lease is held by someone other than `owner` at `now`.
    pub fn held_by_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.owner, self.expires_at) {
            (Some(holder), Some(expires_at)) => holder != owner && expires_at > now,
            _ => false,
        }
    }
}

/// A live ownership claim over one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub partition: PartitionId,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Set of items to be implemented to become a checkpoint store.
///
/// `claim` is optimistic: concurrent claimers race on a compare-and-set and
/// the losers observe `Ok(false)`, never an error. Commits via `put` are
/// cumulative and must keep the stored offset monotonically non-decreasing.
#[trait_variant::make(CheckpointStore: Send)]
pub trait LocalCheckpointStore {
    /// Last committed offset for the partition, if any.
    async fn get(&self, partition: &PartitionId) -> Result<Option<i64>>;

    /// Commits an offset. Keeps lease metadata intact and never moves the
    /// stored offset backwards.
    async fn put(&self, partition: &PartitionId, offset: i64) -> Result<()>;

    /// Claims or renews the partition lease for `owner` with the given TTL.
    /// Returns false when the lease is actively held by another owner or the
    /// compare-and-set lost a race.
    async fn claim(&self, partition: &PartitionId, owner: &str, ttl: Duration) -> Result<bool>;

    /// Takes over the partition lease for `owner` even when another holder's
    /// lease has not expired; the displaced holder observes the loss on its
    /// next renewal. Returns false only when the compare-and-set lost a race.
    async fn steal(&self, partition: &PartitionId, owner: &str, ttl: Duration) -> Result<bool>;

    /// Releases the lease if `owner` holds it; committed offsets survive.
    async fn release(&self, partition: &PartitionId, owner: &str) -> Result<()>;

    /// Snapshot of all lease records, expired ones included; the ownership
    /// manager filters by expiry when counting live instances.
    async fn leases(&self) -> Result<Vec<Lease>>;
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30))
}
