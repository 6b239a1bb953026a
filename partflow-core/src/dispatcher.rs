//! The dispatcher is the orchestration hub: every event delivered by a
//! partition consumer passes through [Dispatcher::dispatch], which invokes
//! the user handler inside the isolation boundary, accumulates per-partition
//! progress, and commits a checkpoint whenever a partition's pending count
//! reaches the threshold.
//!
//! Checkpoints are cumulative: a commit at offset N covers everything up to
//! N, so a failed commit is not retried inline; the pending count is left
//! unreset and the next successful commit subsumes the gap.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::checkpoint::CheckpointStore;
use crate::error::Error;
use crate::handler::{ErrorReporter, EventHandler};
use crate::message::{Event, PartitionId};
use crate::{Result, config};

pub struct Dispatcher<H, C> {
    handler: H,
    reporter: Arc<dyn ErrorReporter>,
    store: Arc<C>,
    /// Events processed since the last committed checkpoint, per partition.
    /// Entries are written only by the owning partition task; the lock makes
    /// each update atomic w.r.t. reads from a rebalance-triggered flush.
    pending: Mutex<HashMap<PartitionId, u64>>,
    threshold: u64,
    commit_timeout: Duration,
}

impl<H, C> Dispatcher<H, C>
where
    H: EventHandler + Sync,
    C: CheckpointStore + Sync,
{
    pub fn new(handler: H, reporter: Arc<dyn ErrorReporter>, store: Arc<C>) -> Self {
        Self {
            handler,
            reporter,
            store,
            pending: Mutex::new(HashMap::new()),
            threshold: config::DEFAULT_CHECKPOINT_THRESHOLD,
            commit_timeout: config::DEFAULT_COMMIT_TIMEOUT,
        }
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn with_commit_timeout(mut self, commit_timeout: Duration) -> Self {
        self.commit_timeout = commit_timeout;
        self
    }

    /// Delivers one event to the handler and advances checkpoint bookkeeping.
    /// Returns whether the event counts as processed. Never fails: handler
    /// errors and commit errors alike go to the error side-channel.
    pub async fn dispatch(&self, event: &Event) -> bool {
        if !self.invoke_handler(event).await {
            return false;
        }

        let due = {
            let mut pending = self.pending.lock();
            let count = pending.entry(event.partition.clone()).or_insert(0);
            *count += 1;
            *count >= self.threshold
        };

        if due {
            match self.commit(&event.partition, event.offset).await {
                Ok(()) => self.reset_pending(&event.partition),
                // leave the count unreset; the next commit covers the backlog
                Err(e) => self.report("checkpoint-commit", &e),
            }
        }
        true
    }

    /// Commits any uncounted progress for a partition regardless of the
    /// threshold; used when a partition drains and by the time-based
    /// fallback policy.
    pub async fn flush(&self, partition: &PartitionId, offset: i64) -> Result<()> {
        if self.pending_count(partition) == 0 {
            return Ok(());
        }
        self.commit(partition, offset).await?;
        self.reset_pending(partition);
        Ok(())
    }

    /// Drops the pending entry of a partition that is no longer owned.
    pub fn forget(&self, partition: &PartitionId) {
        self.pending.lock().remove(partition);
    }

    pub fn pending_count(&self, partition: &PartitionId) -> u64 {
        self.pending.lock().get(partition).copied().unwrap_or(0)
    }

    /// The isolation boundary. Handler errors and panics are reported and
    /// swallowed; the event is treated as not processed so it gets
    /// redelivered after the next restart or rebalance of its partition.
    async fn invoke_handler(&self, event: &Event) -> bool {
        match AssertUnwindSafe(self.handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.report("handler", &e);
                false
            }
            Err(panic) => {
                let error = Error::Handler(format!(
                    "handler panicked processing {}-{}: {}",
                    event.partition,
                    event.offset,
                    panic_message(panic.as_ref())
                ));
                self.report("handler", &error);
                false
            }
        }
    }

    async fn commit(&self, partition: &PartitionId, offset: i64) -> Result<()> {
        debug!(%partition, offset, "committing checkpoint");
        tokio::time::timeout(self.commit_timeout, self.store.put(partition, offset))
            .await
            .map_err(|_| {
                Error::Checkpoint(format!(
                    "commit for {partition} at {offset} timed out after {:?}",
                    self.commit_timeout
                ))
            })?
    }

    fn reset_pending(&self, partition: &PartitionId) {
        self.pending.lock().insert(partition.clone(), 0);
    }

    /// Reports through the side-channel; a reporter that itself panics is
    /// swallowed with no further escalation.
    fn report(&self, operation: &str, error: &Error) {
        let reporter = Arc::clone(&self.reporter);
        if std::panic::catch_unwind(AssertUnwindSafe(|| reporter.report(operation, error)))
            .is_err()
        {
            error!(operation, "error reporter panicked");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::checkpoint::memory::InMemoryCheckpointStore;
    use crate::handler::LogReporter;

    struct OkHandler;

    impl EventHandler for OkHandler {
        async fn handle(&self, _event: &Event) -> Result<()> {
            Ok(())
        }
    }

    struct FailingHandler {
        attempts: AtomicU64,
    }

    impl EventHandler for FailingHandler {
        async fn handle(&self, _event: &Event) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Handler("always failing".to_string()))
        }
    }

    struct PanickingHandler;

    impl EventHandler for PanickingHandler {
        async fn handle(&self, _event: &Event) -> Result<()> {
            panic!("handler blew up");
        }
    }

    struct PanickingReporter;

    impl ErrorReporter for PanickingReporter {
        fn report(&self, _operation: &str, _error: &Error) {
            panic!("reporter blew up");
        }
    }

    fn dispatcher(
        threshold: u64,
        store: &InMemoryCheckpointStore,
    ) -> Dispatcher<OkHandler, InMemoryCheckpointStore> {
        Dispatcher::new(OkHandler, Arc::new(LogReporter), Arc::new(store.clone()))
            .with_threshold(threshold)
    }

    fn p(id: &str) -> PartitionId {
        PartitionId::from(id)
    }

    #[tokio::test]
    async fn commits_exactly_at_threshold() {
        let store = InMemoryCheckpointStore::new();
        let dispatcher = dispatcher(50, &store);

        for offset in 1..=49 {
            assert!(dispatcher.dispatch(&Event::new("0", offset, "{}")).await);
        }
        assert_eq!(store.committed(&p("0")), None);
        assert_eq!(dispatcher.pending_count(&p("0")), 49);

        assert!(dispatcher.dispatch(&Event::new("0", 50, "{}")).await);
        assert_eq!(store.committed(&p("0")), Some(50));
        assert_eq!(store.put_count(), 1);
        assert_eq!(dispatcher.pending_count(&p("0")), 0);
    }

    #[tokio::test]
    async fn commit_failure_leaves_pending_and_next_commit_covers_backlog() {
        let store = InMemoryCheckpointStore::new();
        let dispatcher = dispatcher(3, &store);
        store.fail_next_puts(1);

        for offset in 1..=3 {
            dispatcher.dispatch(&Event::new("0", offset, "{}")).await;
        }
        // the commit at offset 3 failed; progress is still pending
        assert_eq!(store.committed(&p("0")), None);
        assert_eq!(dispatcher.pending_count(&p("0")), 3);

        dispatcher.dispatch(&Event::new("0", 4, "{}")).await;
        assert_eq!(store.committed(&p("0")), Some(4));
        assert_eq!(dispatcher.pending_count(&p("0")), 0);
    }

    #[tokio::test]
    async fn partitions_are_independent() {
        let store = InMemoryCheckpointStore::new();
        let dispatcher = dispatcher(3, &store);

        for offset in 1..=2 {
            dispatcher.dispatch(&Event::new("a", offset, "{}")).await;
        }
        for offset in 1..=3 {
            dispatcher.dispatch(&Event::new("b", offset, "{}")).await;
        }

        // partition b crossed its threshold; a did not
        assert_eq!(store.committed(&p("a")), None);
        assert_eq!(store.committed(&p("b")), Some(3));
        assert_eq!(dispatcher.pending_count(&p("a")), 2);
        assert_eq!(dispatcher.pending_count(&p("b")), 0);
    }

    #[tokio::test]
    async fn failing_handler_is_isolated_and_records_no_progress() {
        let store = InMemoryCheckpointStore::new();
        let handler = FailingHandler {
            attempts: AtomicU64::new(0),
        };
        let dispatcher = Dispatcher::new(handler, Arc::new(LogReporter), Arc::new(store.clone()))
            .with_threshold(2);

        for offset in 1..=5 {
            assert!(!dispatcher.dispatch(&Event::new("0", offset, "{}")).await);
        }
        // every distinct event was still attempted
        assert_eq!(dispatcher.handler.attempts.load(Ordering::SeqCst), 5);
        assert_eq!(dispatcher.pending_count(&p("0")), 0);
        assert_eq!(store.committed(&p("0")), None);
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let store = InMemoryCheckpointStore::new();
        let dispatcher =
            Dispatcher::new(PanickingHandler, Arc::new(LogReporter), Arc::new(store.clone()));

        assert!(!dispatcher.dispatch(&Event::new("0", 1, "{}")).await);
        assert_eq!(store.committed(&p("0")), None);
    }

    #[tokio::test]
    async fn panicking_reporter_is_swallowed() {
        let store = InMemoryCheckpointStore::new();
        let handler = FailingHandler {
            attempts: AtomicU64::new(0),
        };
        let dispatcher = Dispatcher::new(
            handler,
            Arc::new(PanickingReporter),
            Arc::new(store.clone()),
        );

        assert!(!dispatcher.dispatch(&Event::new("0", 1, "{}")).await);
        assert!(!dispatcher.dispatch(&Event::new("0", 2, "{}")).await);
    }

    #[tokio::test]
    async fn flush_commits_below_threshold() {
        let store = InMemoryCheckpointStore::new();
        let dispatcher = dispatcher(50, &store);

        for offset in 1..=7 {
            dispatcher.dispatch(&Event::new("0", offset, "{}")).await;
        }
        dispatcher.flush(&p("0"), 7).await.unwrap();
        assert_eq!(store.committed(&p("0")), Some(7));
        assert_eq!(dispatcher.pending_count(&p("0")), 0);
    }

    #[tokio::test]
    async fn flush_with_no_pending_is_a_noop() {
        let store = InMemoryCheckpointStore::new();
        let dispatcher = dispatcher(50, &store);
        dispatcher.flush(&p("0"), 7).await.unwrap();
        assert_eq!(store.put_count(), 0);
    }
}
