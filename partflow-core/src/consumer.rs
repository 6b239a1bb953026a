//! One [PartitionConsumer] runs per owned partition. It resumes from the
//! committed checkpoint, reads batches from the transport, and pushes each
//! event through the dispatcher strictly in offset order. Transport errors
//! are retried with exponential backoff; exhausting the retries abandons the
//! partition so the ownership layer can reassign it.

use std::sync::Arc;
use std::time::Duration;

use backoff::retry;
use backoff::strategy::exponential::Exponential;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::dispatcher::Dispatcher;
use crate::handler::EventHandler;
use crate::message::PartitionId;
use crate::source::{Source, SourceStream};

const STORE_RETRY_BASE_MS: u64 = 100;
const STORE_RETRY_MAX_MS: u64 = 5_000;
const STORE_RETRY_ATTEMPTS: u16 = 5;

/// How a partition task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerOutcome {
    /// The partition drained cleanly after a cancellation.
    Completed,
    /// The transport or the checkpoint store stayed unreachable past the
    /// retry budget; the partition should be released for reassignment.
    Abandoned,
}

pub struct PartitionConsumer<S, H, C> {
    partition: PartitionId,
    source: S,
    dispatcher: Arc<Dispatcher<H, C>>,
    store: Arc<C>,
    read_timeout: Duration,
    flush_interval: Option<Duration>,
    read_retry: Exponential,
}

impl<S, H, C> PartitionConsumer<S, H, C>
where
    S: Source + Sync,
    H: EventHandler + Sync,
    C: CheckpointStore + Sync,
{
    pub fn new(
        partition: PartitionId,
        source: S,
        dispatcher: Arc<Dispatcher<H, C>>,
        store: Arc<C>,
    ) -> Self {
        Self {
            partition,
            source,
            dispatcher,
            store,
            read_timeout: crate::config::DEFAULT_READ_TIMEOUT,
            flush_interval: None,
            read_retry: Exponential::from_millis(
                STORE_RETRY_BASE_MS,
                STORE_RETRY_MAX_MS,
                2.0,
                0.25,
                Some(STORE_RETRY_ATTEMPTS),
            ),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Enables wall-clock flushing of uncommitted progress in addition to
    /// the dispatcher's count threshold.
    pub fn with_flush_interval(mut self, flush_interval: Option<Duration>) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_read_retry(mut self, read_retry: Exponential) -> Self {
        self.read_retry = read_retry;
        self
    }

    /// Consumes the partition until the token is cancelled or the retry
    /// budget runs out. Progress made since the last threshold commit is
    /// flushed before returning, on both paths.
    pub async fn run(self, token: CancellationToken) -> ConsumerOutcome {
        let start_offset = match self.resume_offset().await {
            Ok(offset) => offset,
            Err(e) => {
                error!(partition = %self.partition, error = %e, "failed to read resume point");
                return ConsumerOutcome::Abandoned;
            }
        };
        info!(partition = %self.partition, start_offset, "starting partition consumer");

        let mut stream = match self.open_stream(start_offset).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(partition = %self.partition, error = %e, "failed to open partition stream");
                return ConsumerOutcome::Abandoned;
            }
        };

        let mut strategy = self.read_retry.clone();
        // the highest offset whose event the handler completed
        let mut last_done: Option<i64> = None;
        let mut last_flush = Instant::now();

        let outcome = 'read: loop {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => break 'read ConsumerOutcome::Completed,
                result = stream.read_batch(self.read_timeout) => result,
            };

            match result {
                Ok(events) => {
                    strategy.reset();
                    for event in &events {
                        if token.is_cancelled() {
                            break 'read ConsumerOutcome::Completed;
                        }
                        if self.dispatcher.dispatch(event).await {
                            last_done = Some(event.offset);
                        }
                    }
                    if let Some(interval) = self.flush_interval
                        && last_flush.elapsed() >= interval
                    {
                        self.flush_progress(last_done).await;
                        last_flush = Instant::now();
                    }
                }
                Err(e) => match strategy.next() {
                    Some(delay) => {
                        warn!(
                            partition = %self.partition,
                            error = %e,
                            ?delay,
                            "transport read failed, backing off"
                        );
                        tokio::select! {
                            _ = token.cancelled() => break 'read ConsumerOutcome::Completed,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        error!(
                            partition = %self.partition,
                            error = %e,
                            "transport retries exhausted, abandoning partition"
                        );
                        break 'read ConsumerOutcome::Abandoned;
                    }
                },
            }
        };

        self.flush_progress(last_done).await;
        info!(partition = %self.partition, ?outcome, "partition consumer stopped");
        outcome
    }

    /// The next offset to read: one past the committed checkpoint, or the
    /// head of the log when the group has no checkpoint yet.
    async fn resume_offset(&self) -> crate::Result<i64> {
        let store = &self.store;
        let partition = &self.partition;
        let committed = retry(
            self.store_retry(),
            || store.get(partition),
            |_: &crate::Error| true,
        )
        .await?;
        Ok(committed.map(|offset| offset + 1).unwrap_or(1))
    }

    async fn open_stream(&self, start_offset: i64) -> crate::Result<S::Stream> {
        let source = &self.source;
        let partition = &self.partition;
        retry(
            self.store_retry(),
            || source.open(partition, start_offset),
            |_: &crate::Error| true,
        )
        .await
    }

    async fn flush_progress(&self, last_done: Option<i64>) {
        let Some(offset) = last_done else { return };
        if let Err(e) = self.dispatcher.flush(&self.partition, offset).await {
            warn!(partition = %self.partition, offset, error = %e, "progress flush failed");
        }
    }

    fn store_retry(&self) -> Exponential {
        Exponential::from_millis(
            STORE_RETRY_BASE_MS,
            STORE_RETRY_MAX_MS,
            2.0,
            0.25,
            Some(STORE_RETRY_ATTEMPTS),
        )
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::Result;
    use crate::checkpoint::memory::InMemoryCheckpointStore;
    use crate::handler::LogReporter;
    use crate::message::Event;
    use crate::source::memory::InMemorySource;

    #[derive(Clone, Default)]
    struct RecordingHandler {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    impl EventHandler for RecordingHandler {
        async fn handle(&self, event: &Event) -> Result<()> {
            self.seen.lock().push(event.offset);
            Ok(())
        }
    }

    fn consumer(
        source: &InMemorySource,
        store: &InMemoryCheckpointStore,
        threshold: u64,
    ) -> (
        PartitionConsumer<InMemorySource, RecordingHandler, InMemoryCheckpointStore>,
        Arc<Mutex<Vec<i64>>>,
    ) {
        let handler = RecordingHandler::default();
        let seen = Arc::clone(&handler.seen);
        let store = Arc::new(store.clone());
        let dispatcher = Arc::new(
            Dispatcher::new(handler, Arc::new(LogReporter), Arc::clone(&store))
                .with_threshold(threshold),
        );
        let consumer = PartitionConsumer::new(
            PartitionId::from("0"),
            source.clone(),
            dispatcher,
            store,
        )
        .with_read_timeout(Duration::from_millis(20))
        .with_read_retry(Exponential::from_millis(5, 20, 2.0, 0.0, Some(3)));
        (consumer, seen)
    }

    async fn wait_for_count(seen: &Arc<Mutex<Vec<i64>>>, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handler never reached the expected event count");
    }

    #[tokio::test]
    async fn resumes_past_committed_checkpoint_in_order() {
        let source = InMemorySource::new(["0"]);
        for i in 1..=8 {
            source.append("0", format!("{{\"n\":{i}}}"));
        }
        let store = InMemoryCheckpointStore::new();
        store.put(&PartitionId::from("0"), 4).await.unwrap();

        let (consumer, seen) = consumer(&source, &store, 50);
        let token = CancellationToken::new();
        let task = tokio::spawn(consumer.run(token.clone()));

        wait_for_count(&seen, 4).await;
        token.cancel();
        assert_eq!(task.await.unwrap(), ConsumerOutcome::Completed);
        assert_eq!(*seen.lock(), vec![5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn drain_flushes_progress_below_threshold() {
        let source = InMemorySource::new(["0"]);
        for i in 1..=7 {
            source.append("0", format!("{{\"n\":{i}}}"));
        }
        let store = InMemoryCheckpointStore::new();

        let (consumer, seen) = consumer(&source, &store, 50);
        let token = CancellationToken::new();
        let task = tokio::spawn(consumer.run(token.clone()));

        wait_for_count(&seen, 7).await;
        assert_eq!(store.committed(&PartitionId::from("0")), None);

        token.cancel();
        assert_eq!(task.await.unwrap(), ConsumerOutcome::Completed);
        assert_eq!(store.committed(&PartitionId::from("0")), Some(7));
    }

    #[tokio::test]
    async fn redelivers_uncommitted_events_after_a_crash() {
        let source = InMemorySource::new(["0"]);
        for i in 1..=5 {
            source.append("0", format!("{{\"n\":{i}}}"));
        }
        let store = InMemoryCheckpointStore::new();

        // first run commits at the threshold (offset 3) and is then killed
        // without a drain, losing the progress on offsets 4 and 5
        let (first, seen) = consumer(&source, &store, 3);
        let task = tokio::spawn(first.run(CancellationToken::new()));
        wait_for_count(&seen, 5).await;
        task.abort();
        let _ = task.await;
        assert_eq!(store.committed(&PartitionId::from("0")), Some(3));

        let (second, seen) = consumer(&source, &store, 3);
        let token = CancellationToken::new();
        let task = tokio::spawn(second.run(token.clone()));
        wait_for_count(&seen, 2).await;
        token.cancel();
        task.await.unwrap();
        // offsets 4 and 5 are seen again, nothing before the checkpoint is
        assert_eq!(*seen.lock(), vec![4, 5]);
    }

    #[tokio::test]
    async fn exhausted_transport_retries_abandon_the_partition() {
        let source = InMemorySource::new(["0"]);
        source.append("0", "{}");
        source.fail_next_reads("0", 100);
        let store = InMemoryCheckpointStore::new();

        let (consumer, _seen) = consumer(&source, &store, 50);
        let outcome = consumer.run(CancellationToken::new()).await;
        assert_eq!(outcome, ConsumerOutcome::Abandoned);
    }

    #[tokio::test]
    async fn interval_flush_commits_without_reaching_threshold() {
        let source = InMemorySource::new(["0"]);
        for i in 1..=3 {
            source.append("0", format!("{{\"n\":{i}}}"));
        }
        let store = InMemoryCheckpointStore::new();

        let (consumer, seen) = consumer(&source, &store, 50);
        let consumer = consumer.with_flush_interval(Some(Duration::from_millis(10)));
        let token = CancellationToken::new();
        let task = tokio::spawn(consumer.run(token.clone()));

        wait_for_count(&seen, 3).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.committed(&PartitionId::from("0")) != Some(3) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("interval flush never committed");

        token.cancel();
        task.await.unwrap();
    }
}
