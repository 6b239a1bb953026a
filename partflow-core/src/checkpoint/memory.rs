use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::checkpoint::{CheckpointRecord, CheckpointStore, Lease, expiry};
use crate::error::{Error, Result};
use crate::message::PartitionId;

/// An in-memory checkpoint store. Sharing one instance between several
/// ownership managers makes it the coordination substrate for multi-instance
/// tests; failure injection exercises the commit-error path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<PartitionId, CheckpointRecord>,
    fail_puts: u32,
    unreachable: bool,
    put_count: u64,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail.
    pub fn fail_next_puts(&self, count: u32) {
        self.inner.lock().fail_puts = count;
    }

    /// Makes every operation fail until switched off again.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    /// Committed offset without going through the async trait; assertions.
    pub fn committed(&self, partition: &PartitionId) -> Option<i64> {
        self.inner
            .lock()
            .records
            .get(partition)
            .and_then(|r| r.offset)
    }

    /// Number of successful commits across all partitions.
    pub fn put_count(&self) -> u64 {
        self.inner.lock().put_count
    }

    fn check_reachable(inner: &Inner) -> Result<()> {
        if inner.unreachable {
            return Err(Error::Checkpoint("store unreachable".to_string()));
        }
        Ok(())
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, partition: &PartitionId) -> Result<Option<i64>> {
        let inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        Ok(inner.records.get(partition).and_then(|r| r.offset))
    }

    async fn put(&self, partition: &PartitionId, offset: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        if inner.fail_puts > 0 {
            inner.fail_puts -= 1;
            return Err(Error::Checkpoint(format!(
                "injected failure committing {partition}"
            )));
        }
        inner.put_count += 1;
        let record = inner.records.entry(partition.clone()).or_default();
        record.offset = Some(record.offset.map_or(offset, |o| o.max(offset)));
        Ok(())
    }

    async fn claim(&self, partition: &PartitionId, owner: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        let now = Utc::now();
        let record = inner.records.entry(partition.clone()).or_default();
        if record.held_by_other(owner, now) {
            return Ok(false);
        }
        record.owner = Some(owner.to_string());
        record.expires_at = Some(expiry(now, ttl));
        Ok(true)
    }

    async fn steal(&self, partition: &PartitionId, owner: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        let record = inner.records.entry(partition.clone()).or_default();
        record.owner = Some(owner.to_string());
        record.expires_at = Some(expiry(Utc::now(), ttl));
        Ok(true)
    }

    async fn release(&self, partition: &PartitionId, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        if let Some(record) = inner.records.get_mut(partition)
            && record.owner.as_deref() == Some(owner)
        {
            record.owner = None;
            record.expires_at = None;
        }
        Ok(())
    }

    async fn leases(&self) -> Result<Vec<Lease>> {
        let inner = self.inner.lock();
        Self::check_reachable(&inner)?;
        Ok(inner
            .records
            .iter()
            .filter_map(|(partition, record)| {
                let owner = record.owner.clone()?;
                let expires_at = record.expires_at?;
                Some(Lease {
                    partition: partition.clone(),
                    owner,
                    expires_at,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn p(id: &str) -> PartitionId {
        PartitionId::from(id)
    }

    #[tokio::test]
    async fn claim_is_exclusive_while_lease_is_live() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.claim(&p("0"), "a", TTL).await.unwrap());
        assert!(!store.claim(&p("0"), "b", TTL).await.unwrap());
        // renewal by the holder succeeds
        assert!(store.claim(&p("0"), "a", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_stolen() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.claim(&p("0"), "a", Duration::ZERO).await.unwrap());
        assert!(store.claim(&p("0"), "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn steal_displaces_a_live_holder() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.claim(&p("0"), "a", TTL).await.unwrap());
        assert!(store.steal(&p("0"), "b", TTL).await.unwrap());
        // the displaced holder fails its next renewal
        assert!(!store.claim(&p("0"), "a", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn release_keeps_committed_offset() {
        let store = InMemoryCheckpointStore::new();
        store.claim(&p("0"), "a", TTL).await.unwrap();
        store.put(&p("0"), 120).await.unwrap();
        store.release(&p("0"), "a").await.unwrap();

        assert_eq!(store.get(&p("0")).await.unwrap(), Some(120));
        assert!(store.leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_noop() {
        let store = InMemoryCheckpointStore::new();
        store.claim(&p("0"), "a", TTL).await.unwrap();
        store.release(&p("0"), "b").await.unwrap();
        assert_eq!(store.leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn offset_never_regresses() {
        let store = InMemoryCheckpointStore::new();
        store.put(&p("0"), 50).await.unwrap();
        store.put(&p("0"), 30).await.unwrap();
        assert_eq!(store.get(&p("0")).await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn injected_put_failures() {
        let store = InMemoryCheckpointStore::new();
        store.fail_next_puts(1);
        assert!(store.put(&p("0"), 1).await.is_err());
        assert!(store.put(&p("0"), 1).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_store_fails_everything() {
        let store = InMemoryCheckpointStore::new();
        store.set_unreachable(true);
        assert!(store.get(&p("0")).await.is_err());
        assert!(store.leases().await.is_err());
        store.set_unreachable(false);
        assert!(store.leases().await.is_ok());
    }
}
