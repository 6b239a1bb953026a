use tracing::info;

use crate::Result;
use crate::document::Document;
use crate::sink::Sink;

/// A sink that logs every document; trivially idempotent.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl Sink for LogSink {
    async fn upsert(&self, id: &str, document: &Document) -> Result<()> {
        info!(id, document = %serde_json::Value::Object(document.clone()), "upsert");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[tokio::test]
    async fn upsert_never_fails() {
        let sink = LogSink;
        let mut document = Document::new();
        document.insert("id".to_string(), Value::String("0-1".to_string()));
        assert!(sink.upsert("0-1", &document).await.is_ok());
    }
}
