//! The downstream document store, consumed through a narrow idempotent-upsert
//! interface. The engine never interprets documents; it only guarantees that
//! a redelivered event reaches the sink with the same id.

use crate::Result;
use crate::document::Document;

/// REST document-store sink.
pub mod http;
/// Logs documents instead of persisting them; the local-debugging sink.
pub mod log;
/// In-memory sink used by tests and local runs.
pub mod memory;

/// Set of items to be implemented to become a Sink.
#[trait_variant::make(Sink: Send)]
pub trait LocalSink {
    /// Upserts the document under the given id. Must be idempotent on id:
    /// writing the same id twice yields one logical document.
    async fn upsert(&self, id: &str, document: &Document) -> Result<()>;
}
