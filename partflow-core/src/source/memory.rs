use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};

use crate::error::{Error, Result};
use crate::message::{Event, PartitionId};
use crate::source::{Source, SourceStream};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const MAX_BATCH: usize = 64;

/// An in-memory partitioned log. Events appended to a partition get
/// consecutive offsets starting at 1, and an open stream replays from any
/// offset, which makes it a faithful stand-in for a durable transport in
/// restart tests. Read failures can be scripted per partition.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    logs: HashMap<PartitionId, Vec<Event>>,
    fail_reads: HashMap<PartitionId, u32>,
}

impl InMemorySource {
    pub fn new<I, P>(partitions: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PartitionId>,
    {
        let logs = partitions
            .into_iter()
            .map(|p| (p.into(), Vec::new()))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                logs,
                fail_reads: HashMap::new(),
            })),
        }
    }

    /// Appends an event to a partition and returns its assigned offset.
    pub fn append(&self, partition: impl Into<PartitionId>, payload: impl Into<Bytes>) -> i64 {
        let partition = partition.into();
        let mut inner = self.inner.lock();
        let log = inner.logs.entry(partition.clone()).or_default();
        let offset = log.last().map(|e| e.offset + 1).unwrap_or(1);
        log.push(Event::new(partition, offset, payload));
        offset
    }

    /// Makes the next `count` reads on a partition fail.
    pub fn fail_next_reads(&self, partition: impl Into<PartitionId>, count: u32) {
        self.inner.lock().fail_reads.insert(partition.into(), count);
    }

    fn take_batch(&self, partition: &PartitionId, from_offset: i64) -> Result<Vec<Event>> {
        let mut inner = self.inner.lock();
        if let Some(remaining) = inner.fail_reads.get_mut(partition)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::Source(format!(
                "injected read failure on partition {partition}"
            )));
        }
        let batch = inner
            .logs
            .get(partition)
            .map(|log| {
                log.iter()
                    .filter(|e| e.offset >= from_offset)
                    .take(MAX_BATCH)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(batch)
    }
}

impl Source for InMemorySource {
    type Stream = InMemoryStream;

    fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<_> = self.inner.lock().logs.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    async fn open(&self, partition: &PartitionId, start_offset: i64) -> Result<Self::Stream> {
        // retention floor is the first offset of the log
        Ok(InMemoryStream {
            source: self.clone(),
            partition: partition.clone(),
            next_offset: start_offset.max(1),
        })
    }
}

/// An open read position on one [InMemorySource] partition.
#[derive(Debug)]
pub struct InMemoryStream {
    source: InMemorySource,
    partition: PartitionId,
    next_offset: i64,
}

impl SourceStream for InMemoryStream {
    async fn read_batch(&mut self, timeout: Duration) -> Result<Vec<Event>> {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.source.take_batch(&self.partition, self.next_offset)?;
            if let Some(last) = batch.last() {
                self.next_offset = last.offset + 1;
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            sleep(POLL_INTERVAL.min(timeout)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_from_requested_offset() {
        let source = InMemorySource::new(["0"]);
        for i in 0..5 {
            source.append("0", format!("{{\"n\":{i}}}"));
        }

        let mut stream = source.open(&PartitionId::from("0"), 3).await.unwrap();
        let batch = stream.read_batch(Duration::from_millis(50)).await.unwrap();
        let offsets: Vec<_> = batch.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn empty_batch_after_timeout() {
        let source = InMemorySource::new(["0"]);
        let mut stream = source.open(&PartitionId::from("0"), 1).await.unwrap();
        let batch = stream.read_batch(Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn scripted_read_failures() {
        let source = InMemorySource::new(["0"]);
        source.append("0", "{}");
        source.fail_next_reads("0", 2);

        let mut stream = source.open(&PartitionId::from("0"), 1).await.unwrap();
        assert!(stream.read_batch(Duration::from_millis(20)).await.is_err());
        assert!(stream.read_batch(Duration::from_millis(20)).await.is_err());
        let batch = stream.read_batch(Duration::from_millis(20)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }
}
