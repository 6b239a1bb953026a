use std::time::Duration;

use async_nats::jetstream::{
    self, Context,
    consumer::{AckPolicy, DeliverPolicy, PullConsumer, pull},
};
use backoff::strategy::exponential::Exponential;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::error::{Error, Result};
use crate::message::{Event, PartitionId};
use crate::source::{Source, SourceStream};

/// Authentication for the NATS connection.
#[derive(Debug, Clone, PartialEq)]
pub struct NatsAuth {
    pub username: String,
    pub password: String,
}

/// Configuration of the JetStream transport. Each partition maps to its own
/// stream named `{stream}-{partition}`, so the JetStream stream sequence
/// doubles as the partition offset.
#[derive(Debug, Clone)]
pub struct JetstreamSourceConfig {
    pub addr: String,
    pub stream: String,
    pub partitions: u16,
    pub auth: Option<NatsAuth>,
}

/// A partitioned source backed by NATS JetStream.
#[derive(Clone)]
pub struct JetstreamSource {
    context: Context,
    stream: String,
    partitions: u16,
}

impl JetstreamSource {
    /// Connects to the JetStream server, retrying transient connection
    /// failures with exponential backoff.
    pub async fn connect(config: JetstreamSourceConfig) -> Result<Self> {
        let strategy = Exponential::from_millis(100, 5_000, 2.0, 0.25, Some(5));
        let client = backoff::retry(strategy, || connect_once(&config), |_| true).await?;
        Ok(Self {
            context: jetstream::new(client),
            stream: config.stream,
            partitions: config.partitions,
        })
    }

    fn stream_name(&self, partition: &PartitionId) -> String {
        format!("{}-{partition}", self.stream)
    }
}

async fn connect_once(config: &JetstreamSourceConfig) -> Result<async_nats::Client> {
    let mut options = async_nats::ConnectOptions::new();
    if let Some(auth) = &config.auth {
        options = options.user_and_password(auth.username.clone(), auth.password.clone());
    }
    async_nats::connect_with_options(&config.addr, options)
        .await
        .map_err(|e| Error::Source(format!("connecting to {}: {e}", config.addr)))
}

impl Source for JetstreamSource {
    type Stream = JetstreamStream;

    fn partitions(&self) -> Vec<PartitionId> {
        (0..self.partitions)
            .map(|i| PartitionId::new(i.to_string()))
            .collect()
    }

    async fn open(&self, partition: &PartitionId, start_offset: i64) -> Result<Self::Stream> {
        let stream_name = self.stream_name(partition);
        let stream = self
            .context
            .get_stream(&stream_name)
            .await
            .map_err(|e| Error::Source(format!("getting stream {stream_name}: {e}")))?;

        // An ephemeral consumer per open keeps the read position entirely in
        // our hands: resumption is ByStartSequence from the checkpoint, not
        // from broker-side consumer state.
        let consumer: PullConsumer = stream
            .create_consumer(pull::Config {
                deliver_policy: DeliverPolicy::ByStartSequence {
                    start_sequence: start_offset.max(1) as u64,
                },
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Source(format!("creating consumer on {stream_name}: {e}")))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Source(format!("subscribing to {stream_name}: {e}")))?;

        Ok(JetstreamStream {
            partition: partition.clone(),
            messages,
        })
    }
}

/// An open read position on one partition's JetStream stream.
pub struct JetstreamStream {
    partition: PartitionId,
    messages: pull::Stream,
}

impl SourceStream for JetstreamStream {
    async fn read_batch(&mut self, timeout: Duration) -> Result<Vec<Event>> {
        let mut batch = Vec::new();
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;

                _ = &mut sleep => break,

                message = self.messages.next() => {
                    let Some(message) = message else {
                        break;
                    };
                    let message = message.map_err(|e| {
                        Error::Source(format!("reading partition {}: {e}", self.partition))
                    })?;
                    let info = message
                        .info()
                        .map_err(|e| {
                            Error::Source(format!("reading message metadata: {e}"))
                        })?;
                    let offset = info.stream_sequence as i64;
                    let published = chrono::DateTime::from_timestamp(
                        info.published.unix_timestamp(),
                        info.published.nanosecond(),
                    )
                    .unwrap_or_default();
                    // Broker-side ack only releases redelivery tracking; the
                    // durable position is the checkpoint.
                    if let Err(e) = message.ack().await {
                        warn!(partition = %self.partition, offset, ?e, "failed to ack message");
                    }
                    batch.push(
                        Event::new(
                            self.partition.clone(),
                            offset,
                            message.payload.clone(),
                        )
                        .with_event_time(published),
                    );
                }
            }
        }
        Ok(batch)
    }
}
