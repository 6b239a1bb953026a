//! The two user-injected seams of the engine: the event handler invoked for
//! every delivered event, and the error reporter fed by the side-channel.
//! Both are fixed at dispatcher construction for its whole lifetime; there is
//! no registration protocol.

use tracing::error;

use crate::Result;
use crate::document;
use crate::error::Error;
use crate::message::Event;
use crate::sink::Sink;

/// The per-event user handler: transform the event and write the result
/// downstream. Failures are isolated by the dispatcher; returning an error
/// marks the event as not processed (it will be redelivered after a
/// restart/rebalance), nothing more.
#[trait_variant::make(EventHandler: Send)]
pub trait LocalEventHandler {
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Side-channel for failures anywhere on the processing path. Implementations
/// must not assume they are called on any particular task; a panicking
/// reporter is swallowed by the dispatcher.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, operation: &str, error: &Error);
}

/// Reports failures as structured `tracing` events; the default reporter.
#[derive(Debug, Clone, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, operation: &str, error: &Error) {
        error!(operation, %error, "processing failure");
    }
}

/// The built-in handler: parse the payload into a document, inject the
/// deterministic id, upsert into the sink.
#[derive(Debug, Clone)]
pub struct DocumentWriter<K> {
    sink: K,
}

impl<K> DocumentWriter<K> {
    pub fn new(sink: K) -> Self {
        Self { sink }
    }
}

impl<K> EventHandler for DocumentWriter<K>
where
    K: Sink + Sync,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        let doc = document::to_document(event)?;
        let id = document::document_id(&event.partition, event.offset);
        self.sink.upsert(&id, &doc).await
    }
}

#[cfg(test)]
mod tests {
    use super::{DocumentWriter, EventHandler};
    use crate::error::Error;
    use crate::message::Event;
    use crate::sink::memory::InMemorySink;

    #[tokio::test]
    async fn writes_document_under_derived_id() {
        let sink = InMemorySink::new();
        let writer = DocumentWriter::new(sink.clone());

        let event = Event::new("3", 17, r#"{"temp": 20}"#);
        writer.handle(&event).await.unwrap();

        let doc = sink.get("3-17").expect("document should exist");
        assert_eq!(doc.get("temp").unwrap(), 20);
        assert_eq!(doc.get("id").unwrap(), "3-17");
    }

    #[tokio::test]
    async fn redelivery_does_not_duplicate() {
        let sink = InMemorySink::new();
        let writer = DocumentWriter::new(sink.clone());

        let event = Event::new("0", 5, r#"{"n": 1}"#);
        writer.handle(&event).await.unwrap();
        writer.handle(&event).await.unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.upsert_count(), 2);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_handler_error() {
        let sink = InMemorySink::new();
        let writer = DocumentWriter::new(sink.clone());

        let event = Event::new("0", 1, "not json");
        assert!(writer.handle(&event).await.is_err());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn sink_failure_propagates_to_dispatcher() {
        let sink = InMemorySink::new();
        sink.fail_next_upserts(1);
        let writer = DocumentWriter::new(sink.clone());

        let event = Event::new("0", 1, "{}");
        assert!(matches!(writer.handle(&event).await, Err(Error::Sink(_))));
    }
}
