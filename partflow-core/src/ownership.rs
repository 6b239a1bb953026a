//! Lease-based partition ownership. Every instance of a consumer group runs
//! one [OwnershipManager]; the managers coordinate purely through the
//! checkpoint store's lease records, with no direct channel between
//! instances. Each rebalance cycle renews held leases, sheds partitions past
//! the instance's fair share, claims free ones, and steals from a busier
//! instance when nothing is free. The displaced holder notices on its next
//! renewal, so ownership converges without a coordinator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::checkpoint::{CheckpointStore, Lease};
use crate::error::Error;
use crate::message::PartitionId;

const EVENT_CHANNEL_SIZE: usize = 64;

/// Ownership changes reported to the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionEvent {
    /// The instance now holds the partition's lease.
    Claimed(PartitionId),
    /// The lease was lost, shed, or failed to renew.
    Lost(PartitionId),
}

#[derive(Debug, Clone)]
pub struct OwnershipPolicy {
    pub lease_ttl: Duration,
    pub rebalance_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for OwnershipPolicy {
    fn default() -> Self {
        Self {
            lease_ttl: crate::config::DEFAULT_LEASE_TTL,
            rebalance_interval: crate::config::DEFAULT_REBALANCE_INTERVAL,
            drain_timeout: crate::config::DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

enum Command {
    Abandon(PartitionId),
}

/// Lets a partition task hand its partition back without holding a reference
/// to the whole manager.
#[derive(Clone)]
pub struct AbandonHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl AbandonHandle {
    /// Releases the partition's lease so another instance can pick it up.
    /// The partition is not blacklisted; a later rebalance may reclaim it.
    pub async fn abandon(&self, partition: PartitionId) {
        let _ = self.cmd_tx.send(Command::Abandon(partition)).await;
    }
}

pub struct OwnershipManager<C> {
    store: Arc<C>,
    owner: String,
    partitions: Vec<PartitionId>,
    policy: OwnershipPolicy,
    owned: Arc<Mutex<HashSet<PartitionId>>>,
    events_tx: mpsc::Sender<PartitionEvent>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Option<mpsc::Receiver<Command>>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<C> OwnershipManager<C>
where
    C: CheckpointStore + Sync + 'static,
{
    pub fn new(
        store: Arc<C>,
        owner: impl Into<String>,
        partitions: Vec<PartitionId>,
        policy: OwnershipPolicy,
    ) -> (Self, mpsc::Receiver<PartitionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (cmd_tx, cmd_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let manager = Self {
            store,
            owner: owner.into(),
            partitions,
            policy,
            owned: Arc::new(Mutex::new(HashSet::new())),
            events_tx,
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            token: CancellationToken::new(),
            task: None,
        };
        (manager, events_rx)
    }

    /// Probes the store once, then spawns the rebalance loop. An unreachable
    /// store at this point is a startup failure, not something to retry
    /// silently in the background.
    pub async fn start(&mut self) -> Result<()> {
        self.store.leases().await.map_err(|e| {
            Error::Ownership(format!("checkpoint store unreachable at startup: {e}"))
        })?;
        let cmd_rx = self
            .cmd_rx
            .take()
            .ok_or_else(|| Error::Ownership("ownership manager already started".to_string()))?;
        let rebalancer = Rebalancer {
            store: Arc::clone(&self.store),
            owner: self.owner.clone(),
            partitions: self.partitions.clone(),
            policy: self.policy.clone(),
            owned: Arc::clone(&self.owned),
            events_tx: self.events_tx.clone(),
        };
        self.task = Some(tokio::spawn(rebalancer.run(cmd_rx, self.token.clone())));
        Ok(())
    }

    pub fn abandon_handle(&self) -> AbandonHandle {
        AbandonHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Snapshot of the partitions this instance currently holds.
    pub fn owned(&self) -> HashSet<PartitionId> {
        self.owned.lock().clone()
    }

    /// Stops the rebalance loop and releases every held lease so peers can
    /// take over immediately instead of waiting out the TTLs. Never errors;
    /// shutdown proceeds regardless.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take()
            && time::timeout(self.policy.drain_timeout, task).await.is_err()
        {
            warn!("rebalance loop did not stop within the drain timeout");
        }
        let owned: Vec<PartitionId> = self.owned.lock().drain().collect();
        for partition in owned {
            if let Err(e) = self.store.release(&partition, &self.owner).await {
                warn!(%partition, error = %e, "failed to release lease during shutdown");
            }
        }
    }
}

struct Rebalancer<C> {
    store: Arc<C>,
    owner: String,
    partitions: Vec<PartitionId>,
    policy: OwnershipPolicy,
    owned: Arc<Mutex<HashSet<PartitionId>>>,
    events_tx: mpsc::Sender<PartitionEvent>,
}

impl<C> Rebalancer<C>
where
    C: CheckpointStore + Sync,
{
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, token: CancellationToken) {
        let mut ticker = time::interval(self.policy.rebalance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(Command::Abandon(partition)) = cmd_rx.recv() => {
                    self.abandon(partition).await;
                }
                _ = ticker.tick() => self.rebalance().await,
            }
        }
    }

    async fn abandon(&mut self, partition: PartitionId) {
        info!(%partition, "abandoning partition");
        self.owned.lock().remove(&partition);
        if let Err(e) = self.store.release(&partition, &self.owner).await {
            warn!(%partition, error = %e, "failed to release abandoned lease");
        }
    }

    /// One coordination cycle. Store errors inside a cycle are transient;
    /// the cycle is skipped and the next tick tries again.
    async fn rebalance(&mut self) {
        let leases = match self.store.leases().await {
            Ok(leases) => leases,
            Err(e) => {
                warn!(error = %e, "skipping rebalance, lease listing failed");
                return;
            }
        };
        let now = Utc::now();
        let live: Vec<&Lease> = leases.iter().filter(|l| l.expires_at > now).collect();

        let mut instances: HashSet<&str> = live.iter().map(|l| l.owner.as_str()).collect();
        instances.insert(self.owner.as_str());
        let fair_share = self.partitions.len().div_ceil(instances.len()).max(1);

        self.renew_held().await;
        self.shed_to(fair_share).await;
        self.claim_free(&live, fair_share).await;
        self.steal_if_starved(&live, fair_share).await;
    }

    async fn renew_held(&mut self) {
        let held: Vec<PartitionId> = self.owned.lock().iter().cloned().collect();
        for partition in held {
            let kept = match self
                .store
                .claim(&partition, &self.owner, self.policy.lease_ttl)
                .await
            {
                Ok(kept) => kept,
                Err(e) => {
                    warn!(%partition, error = %e, "lease renewal failed");
                    false
                }
            };
            if !kept {
                info!(%partition, "lost partition lease");
                self.owned.lock().remove(&partition);
                self.emit(PartitionEvent::Lost(partition)).await;
            }
        }
    }

    async fn shed_to(&mut self, fair_share: usize) {
        loop {
            let victim = {
                let mut owned = self.owned.lock();
                if owned.len() <= fair_share {
                    None
                } else {
                    let partition = owned.iter().next().cloned();
                    if let Some(partition) = &partition {
                        owned.remove(partition);
                    }
                    partition
                }
            };
            let Some(partition) = victim else { break };
            info!(%partition, "shedding partition over fair share");
            if let Err(e) = self.store.release(&partition, &self.owner).await {
                warn!(%partition, error = %e, "failed to release shed lease");
            }
            self.emit(PartitionEvent::Lost(partition)).await;
        }
    }

    async fn claim_free(&mut self, live: &[&Lease], fair_share: usize) {
        let held: HashSet<&PartitionId> = live.iter().map(|l| &l.partition).collect();
        let mut candidates: Vec<PartitionId> = self
            .partitions
            .iter()
            .filter(|p| !held.contains(p) && !self.owned.lock().contains(p))
            .cloned()
            .collect();
        // randomized claim order spreads competing instances across the free
        // partitions instead of having them all race on the same one
        candidates.shuffle(&mut rand::rng());

        for partition in candidates {
            if self.owned.lock().len() >= fair_share {
                break;
            }
            match self
                .store
                .claim(&partition, &self.owner, self.policy.lease_ttl)
                .await
            {
                Ok(true) => {
                    info!(%partition, "claimed partition");
                    self.owned.lock().insert(partition.clone());
                    self.emit(PartitionEvent::Claimed(partition)).await;
                }
                Ok(false) => {}
                Err(e) => warn!(%partition, error = %e, "claim failed"),
            }
        }
    }

    /// Takes at most one partition per cycle from the instance holding the
    /// most, and only while that instance is over the fair share. One steal
    /// per cycle keeps churn bounded while the group converges.
    async fn steal_if_starved(&mut self, live: &[&Lease], fair_share: usize) {
        if self.owned.lock().len() >= fair_share {
            return;
        }
        let mut loads: HashMap<&str, Vec<&PartitionId>> = HashMap::new();
        for lease in live {
            if lease.owner != self.owner {
                loads
                    .entry(lease.owner.as_str())
                    .or_default()
                    .push(&lease.partition);
            }
        }
        let Some((_, victims)) = loads
            .iter()
            .filter(|(_, partitions)| partitions.len() > fair_share)
            .max_by_key(|(_, partitions)| partitions.len())
        else {
            return;
        };
        let mut victims: Vec<PartitionId> = victims.iter().map(|p| (*p).clone()).collect();
        victims.shuffle(&mut rand::rng());
        let Some(partition) = victims.into_iter().next() else {
            return;
        };
        match self
            .store
            .steal(&partition, &self.owner, self.policy.lease_ttl)
            .await
        {
            Ok(true) => {
                info!(%partition, "stole partition from an overloaded instance");
                self.owned.lock().insert(partition.clone());
                self.emit(PartitionEvent::Claimed(partition)).await;
            }
            Ok(false) => {}
            Err(e) => warn!(%partition, error = %e, "steal failed"),
        }
    }

    async fn emit(&self, event: PartitionEvent) {
        // a dropped receiver means the processor is gone; nothing to report to
        let _ = self.events_tx.send(event).await;
    }
}
