use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::document::Document;
use crate::sink::Sink;

/// An in-memory document store keyed by document id. Upserts overwrite, so a
/// redelivered event leaves exactly one logical document behind. Failures can
/// be injected to exercise the handler-error path.
#[derive(Debug, Clone, Default)]
pub struct InMemorySink {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    documents: BTreeMap<String, Document>,
    upsert_count: u64,
    fail_upserts: u32,
    always_fail: bool,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` upserts fail.
    pub fn fail_next_upserts(&self, count: u32) {
        self.inner.lock().fail_upserts = count;
    }

    /// Makes every upsert fail until switched off again.
    pub fn set_always_fail(&self, always_fail: bool) {
        self.inner.lock().always_fail = always_fail;
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.inner.lock().documents.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().documents.keys().cloned().collect()
    }

    /// Number of distinct documents stored.
    pub fn len(&self) -> usize {
        self.inner.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().documents.is_empty()
    }

    /// Total upsert invocations, including overwrites of the same id.
    pub fn upsert_count(&self) -> u64 {
        self.inner.lock().upsert_count
    }
}

impl Sink for InMemorySink {
    async fn upsert(&self, id: &str, document: &Document) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.always_fail {
            return Err(Error::Sink(format!("injected failure upserting {id}")));
        }
        if inner.fail_upserts > 0 {
            inner.fail_upserts -= 1;
            return Err(Error::Sink(format!("injected failure upserting {id}")));
        }
        inner.upsert_count += 1;
        inner.documents.insert(id.to_string(), document.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn doc(field: &str) -> Document {
        let mut document = Document::new();
        document.insert("field".to_string(), Value::String(field.to_string()));
        document
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_id() {
        let sink = InMemorySink::new();
        sink.upsert("0-1", &doc("a")).await.unwrap();
        sink.upsert("0-1", &doc("a")).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.upsert_count(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let sink = InMemorySink::new();
        sink.fail_next_upserts(1);
        assert!(sink.upsert("0-1", &doc("a")).await.is_err());
        assert!(sink.upsert("0-1", &doc("a")).await.is_ok());
    }
}
