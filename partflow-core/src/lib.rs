//! A partitioned, checkpointed event-stream consumer. Instances of a
//! consumer group split the stream's partitions between themselves through
//! store-backed leases, process each owned partition strictly in order, and
//! commit durable checkpoints so a restarted instance resumes where the
//! group left off. Delivery is at-least-once; the document ids written to
//! the sink are derived from partition and offset, so replayed events
//! overwrite rather than duplicate.

use std::sync::Arc;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use self::error::{Error, Result};

mod error;

pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod document;
pub mod handler;
pub mod message;
pub mod ownership;
pub mod processor;
pub mod sink;
pub mod source;

use crate::checkpoint::jetstream::{JetstreamCheckpointStore, JetstreamStoreConfig};
use crate::config::Settings;
use crate::dispatcher::Dispatcher;
use crate::handler::{DocumentWriter, LogReporter};
use crate::ownership::{OwnershipManager, OwnershipPolicy};
use crate::processor::EventProcessor;
use crate::sink::http::{HttpSink, HttpSinkConfig};
use crate::source::Source;
use crate::source::jetstream::{JetstreamSource, JetstreamSourceConfig};

/// Wires the JetStream transport, the KV checkpoint store, and the HTTP
/// document sink into an [EventProcessor] and runs it until SIGINT/SIGTERM.
pub async fn run(settings: Settings) -> Result<()> {
    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let source = JetstreamSource::connect(JetstreamSourceConfig {
        addr: settings.stream_url.clone(),
        stream: settings.stream.clone(),
        partitions: settings.partitions,
        auth: settings.nats_auth.clone(),
    })
    .await?;

    let store = Arc::new(
        JetstreamCheckpointStore::connect(JetstreamStoreConfig {
            addr: settings.store_url.clone(),
            bucket: settings.checkpoint_bucket.clone(),
            group: settings.consumer_group.clone(),
            auth: settings.nats_auth.clone(),
        })
        .await?,
    );

    let sink = HttpSink::new(HttpSinkConfig {
        endpoint: settings.sink_url.clone(),
        database: settings.sink_database.clone(),
        container: settings.sink_container.clone(),
        timeout: settings.sink_timeout,
    })?;

    let dispatcher = Arc::new(
        Dispatcher::new(
            DocumentWriter::new(sink),
            Arc::new(LogReporter),
            Arc::clone(&store),
        )
        .with_threshold(settings.checkpoint_threshold)
        .with_commit_timeout(settings.commit_timeout),
    );

    let partitions = source.partitions();
    let (manager, events_rx) = OwnershipManager::new(
        Arc::clone(&store),
        settings.instance_id.clone(),
        partitions,
        OwnershipPolicy {
            lease_ttl: settings.lease_ttl,
            rebalance_interval: settings.rebalance_interval,
            drain_timeout: settings.drain_timeout,
        },
    );

    let processor = EventProcessor::new(source, dispatcher, store, manager, events_rx)
        .with_read_timeout(settings.read_timeout)
        .with_flush_interval(settings.flush_interval)
        .with_drain_timeout(settings.drain_timeout);

    info!(
        instance_id = settings.instance_id,
        group = settings.consumer_group,
        stream = settings.stream,
        "starting event processor"
    );
    let result = processor.run(cln_token).await;

    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    info!("Gracefully Exiting...");
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
        info!("Received terminate signal");
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
