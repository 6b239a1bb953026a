use std::time::Duration;

use async_nats::jetstream::{self, Context, kv};
use backoff::strategy::exponential::Exponential;
use bytes::Bytes;
use chrono::Utc;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::checkpoint::{CheckpointRecord, CheckpointStore, Lease, expiry};
use crate::error::{Error, Result};
use crate::message::PartitionId;
use crate::source::jetstream::NatsAuth;

/// Compare-and-set attempts before an operation gives up. Conflicts are
/// expected: the ownership manager renews the lease on the same key the
/// dispatcher commits offsets to.
const CAS_ATTEMPTS: u32 = 3;

/// Configuration of the JetStream KV checkpoint store.
#[derive(Debug, Clone)]
pub struct JetstreamStoreConfig {
    pub addr: String,
    /// KV bucket holding the checkpoint records.
    pub bucket: String,
    /// Consumer group; scopes the record keys so independent groups keep
    /// independent progress over the same stream.
    pub group: String,
    pub auth: Option<NatsAuth>,
}

/// A checkpoint store backed by a NATS JetStream KV bucket. One key per
/// partition (`{group}.{partition}`) holds a JSON [CheckpointRecord]; lease
/// claims race on the KV revision.
#[derive(Clone)]
pub struct JetstreamCheckpointStore {
    kv: kv::Store,
    group: String,
}

impl JetstreamCheckpointStore {
    /// Connects and binds to the bucket, creating it when absent. Connection
    /// failures are retried with exponential backoff.
    pub async fn connect(config: JetstreamStoreConfig) -> Result<Self> {
        let strategy = Exponential::from_millis(100, 5_000, 2.0, 0.25, Some(5));
        let client = backoff::retry(strategy, || connect_once(&config), |_| true).await?;
        Self::new(jetstream::new(client), &config.bucket, &config.group).await
    }

    pub async fn new(context: Context, bucket: &str, group: &str) -> Result<Self> {
        let kv = match context.get_key_value(bucket).await {
            Ok(kv) => kv,
            Err(_) => context
                .create_key_value(kv::Config {
                    bucket: bucket.to_string(),
                    history: 1,
                    ..Default::default()
                })
                .await
                .map_err(|e| Error::Checkpoint(format!("creating bucket {bucket}: {e}")))?,
        };
        Ok(Self {
            kv,
            group: group.to_string(),
        })
    }

    fn key(&self, partition: &PartitionId) -> String {
        format!("{}.{partition}", self.group)
    }

    async fn entry(&self, key: &str) -> Result<Option<(CheckpointRecord, u64)>> {
        let Some(entry) = self
            .kv
            .entry(key)
            .await
            .map_err(|e| Error::Checkpoint(format!("reading {key}: {e}")))?
        else {
            return Ok(None);
        };
        let record = decode(&entry.value)?;
        Ok(Some((record, entry.revision)))
    }
}

async fn connect_once(config: &JetstreamStoreConfig) -> Result<async_nats::Client> {
    let mut options = async_nats::ConnectOptions::new();
    if let Some(auth) = &config.auth {
        options = options.user_and_password(auth.username.clone(), auth.password.clone());
    }
    async_nats::connect_with_options(&config.addr, options)
        .await
        .map_err(|e| Error::Checkpoint(format!("connecting to {}: {e}", config.addr)))
}

fn decode(value: &[u8]) -> Result<CheckpointRecord> {
    serde_json::from_slice(value)
        .map_err(|e| Error::Checkpoint(format!("parsing checkpoint record: {e}")))
}

fn encode(record: &CheckpointRecord) -> Result<Bytes> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|e| Error::Checkpoint(format!("serializing checkpoint record: {e}")))
}

impl CheckpointStore for JetstreamCheckpointStore {
    async fn get(&self, partition: &PartitionId) -> Result<Option<i64>> {
        let key = self.key(partition);
        Ok(self.entry(&key).await?.and_then(|(record, _)| record.offset))
    }

    async fn put(&self, partition: &PartitionId, offset: i64) -> Result<()> {
        let key = self.key(partition);
        for _ in 0..CAS_ATTEMPTS {
            match self.entry(&key).await? {
                Some((mut record, revision)) => {
                    record.offset = Some(record.offset.map_or(offset, |o| o.max(offset)));
                    if self
                        .kv
                        .update(&key, encode(&record)?, revision)
                        .await
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
                None => {
                    let record = CheckpointRecord {
                        offset: Some(offset),
                        ..Default::default()
                    };
                    if self.kv.create(&key, encode(&record)?).await.is_ok() {
                        return Ok(());
                    }
                }
            }
        }
        Err(Error::Checkpoint(format!(
            "committing {partition} at {offset}: compare-and-set kept failing"
        )))
    }

    async fn claim(&self, partition: &PartitionId, owner: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(partition);
        for _ in 0..CAS_ATTEMPTS {
            let now = Utc::now();
            match self.entry(&key).await? {
                Some((mut record, revision)) => {
                    if record.held_by_other(owner, now) {
                        return Ok(false);
                    }
                    record.owner = Some(owner.to_string());
                    record.expires_at = Some(expiry(now, ttl));
                    if self
                        .kv
                        .update(&key, encode(&record)?, revision)
                        .await
                        .is_ok()
                    {
                        return Ok(true);
                    }
                }
                None => {
                    let record = CheckpointRecord {
                        offset: None,
                        owner: Some(owner.to_string()),
                        expires_at: Some(expiry(now, ttl)),
                    };
                    if self.kv.create(&key, encode(&record)?).await.is_ok() {
                        return Ok(true);
                    }
                }
            }
        }
        // every attempt lost the race; treat as not claimed
        Ok(false)
    }

    async fn steal(&self, partition: &PartitionId, owner: &str, ttl: Duration) -> Result<bool> {
        let key = self.key(partition);
        for _ in 0..CAS_ATTEMPTS {
            let now = Utc::now();
            match self.entry(&key).await? {
                Some((mut record, revision)) => {
                    record.owner = Some(owner.to_string());
                    record.expires_at = Some(expiry(now, ttl));
                    if self
                        .kv
                        .update(&key, encode(&record)?, revision)
                        .await
                        .is_ok()
                    {
                        return Ok(true);
                    }
                }
                None => {
                    let record = CheckpointRecord {
                        offset: None,
                        owner: Some(owner.to_string()),
                        expires_at: Some(expiry(now, ttl)),
                    };
                    if self.kv.create(&key, encode(&record)?).await.is_ok() {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    async fn release(&self, partition: &PartitionId, owner: &str) -> Result<()> {
        let key = self.key(partition);
        for _ in 0..CAS_ATTEMPTS {
            let Some((mut record, revision)) = self.entry(&key).await? else {
                return Ok(());
            };
            if record.owner.as_deref() != Some(owner) {
                return Ok(());
            }
            record.owner = None;
            record.expires_at = None;
            if self
                .kv
                .update(&key, encode(&record)?, revision)
                .await
                .is_ok()
            {
                return Ok(());
            }
        }
        warn!(%partition, owner, "lease release kept losing the compare-and-set");
        Ok(())
    }

    async fn leases(&self) -> Result<Vec<Lease>> {
        let prefix = format!("{}.", self.group);
        let mut keys = self
            .kv
            .keys()
            .await
            .map_err(|e| Error::Checkpoint(format!("listing checkpoint keys: {e}")))?;

        let mut leases = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| Error::Checkpoint(format!("listing checkpoint keys: {e}")))?;
            let Some(partition) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Some((record, _)) = self.entry(&key).await? else {
                continue;
            };
            if let (Some(owner), Some(expires_at)) = (record.owner, record.expires_at) {
                leases.push(Lease {
                    partition: PartitionId::from(partition),
                    owner,
                    expires_at,
                });
            }
        }
        Ok(leases)
    }
}
