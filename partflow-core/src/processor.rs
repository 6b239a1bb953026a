//! The [EventProcessor] ties the layers together: it listens to ownership
//! changes and keeps exactly one consumer task alive per owned partition,
//! cancelling the task when the lease is lost and handing the partition back
//! when a consumer abandons it. Shutdown cancels every task and bounds the
//! drain with the configured timeout.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::checkpoint::CheckpointStore;
use crate::consumer::{ConsumerOutcome, PartitionConsumer};
use crate::dispatcher::Dispatcher;
use crate::handler::EventHandler;
use crate::message::PartitionId;
use crate::ownership::{OwnershipManager, PartitionEvent};
use crate::source::Source;

const DONE_CHANNEL_SIZE: usize = 64;

pub struct EventProcessor<S, H, C> {
    source: S,
    dispatcher: Arc<Dispatcher<H, C>>,
    store: Arc<C>,
    manager: OwnershipManager<C>,
    events_rx: mpsc::Receiver<PartitionEvent>,
    read_timeout: Duration,
    flush_interval: Option<Duration>,
    drain_timeout: Duration,
}

struct PartitionTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl<S, H, C> EventProcessor<S, H, C>
where
    S: Source + Clone + Send + Sync + 'static,
    H: EventHandler + Send + Sync + 'static,
    C: CheckpointStore + Send + Sync + 'static,
{
    pub fn new(
        source: S,
        dispatcher: Arc<Dispatcher<H, C>>,
        store: Arc<C>,
        manager: OwnershipManager<C>,
        events_rx: mpsc::Receiver<PartitionEvent>,
    ) -> Self {
        Self {
            source,
            dispatcher,
            store,
            manager,
            events_rx,
            read_timeout: crate::config::DEFAULT_READ_TIMEOUT,
            flush_interval: None,
            drain_timeout: crate::config::DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Option<Duration>) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Runs until the token is cancelled. Returns an error only when the
    /// ownership layer cannot start; everything after startup is handled by
    /// reassignment, not by terminating the processor.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        self.manager.start().await?;
        let abandon = self.manager.abandon_handle();

        let (done_tx, mut done_rx) = mpsc::channel::<(PartitionId, ConsumerOutcome)>(DONE_CHANNEL_SIZE);
        let mut tasks: HashMap<PartitionId, PartitionTask> = HashMap::new();
        // partitions re-claimed while their previous task is still draining
        let mut pending_restart: HashSet<PartitionId> = HashSet::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(event) = self.events_rx.recv() => match event {
                    PartitionEvent::Claimed(partition) => {
                        if tasks.contains_key(&partition) {
                            pending_restart.insert(partition);
                        } else {
                            self.spawn_consumer(&partition, &token, &done_tx, &mut tasks);
                        }
                    }
                    PartitionEvent::Lost(partition) => {
                        pending_restart.remove(&partition);
                        if let Some(task) = tasks.get(&partition) {
                            info!(%partition, "lease lost, draining partition task");
                            task.token.cancel();
                        }
                    }
                },
                Some((partition, outcome)) = done_rx.recv() => {
                    tasks.remove(&partition);
                    self.dispatcher.forget(&partition);
                    if outcome == ConsumerOutcome::Abandoned {
                        pending_restart.remove(&partition);
                        abandon.abandon(partition).await;
                    } else if pending_restart.remove(&partition) {
                        self.spawn_consumer(&partition, &token, &done_tx, &mut tasks);
                    }
                }
            }
        }

        info!(active = tasks.len(), "shutting down, draining partition tasks");
        for task in tasks.values() {
            task.token.cancel();
        }
        let deadline = Instant::now() + self.drain_timeout;
        while !tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match time::timeout(remaining, done_rx.recv()).await {
                Ok(Some((partition, _))) => {
                    tasks.remove(&partition);
                }
                _ => break,
            }
        }
        for (partition, task) in tasks {
            warn!(%partition, "partition task did not drain in time, aborting");
            task.handle.abort();
        }
        self.manager.stop().await;
        Ok(())
    }

    fn spawn_consumer(
        &self,
        partition: &PartitionId,
        root: &CancellationToken,
        done_tx: &mpsc::Sender<(PartitionId, ConsumerOutcome)>,
        tasks: &mut HashMap<PartitionId, PartitionTask>,
    ) {
        let consumer = PartitionConsumer::new(
            partition.clone(),
            self.source.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.store),
        )
        .with_read_timeout(self.read_timeout)
        .with_flush_interval(self.flush_interval);

        let token = root.child_token();
        let task_token = token.clone();
        let done_tx = done_tx.clone();
        let partition_for_task = partition.clone();
        let handle = tokio::spawn(async move {
            let outcome = consumer.run(task_token).await;
            let _ = done_tx.send((partition_for_task, outcome)).await;
        });
        tasks.insert(partition.clone(), PartitionTask { token, handle });
    }
}
