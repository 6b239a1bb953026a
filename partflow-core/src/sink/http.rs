use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use crate::error::{Error, Result};
use crate::document::Document;
use crate::sink::Sink;

/// Configuration for the REST document-store sink.
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Base endpoint of the document store.
    pub endpoint: String,
    /// Database to write into.
    pub database: String,
    /// Container (collection) to write into.
    pub container: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// A sink that upserts documents over HTTP:
/// `PUT {endpoint}/{database}/{container}/{id}` with the document as the JSON
/// body. Idempotency is the store's contract for PUT on a fixed id.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    config: HttpSinkConfig,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Sink(format!("building HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn document_url(&self, id: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.database,
            self.config.container,
            id
        )
    }
}

impl Sink for HttpSink {
    async fn upsert(&self, id: &str, document: &Document) -> Result<()> {
        let url = self.document_url(id);
        let response = self
            .client
            .put(&url)
            .json(&Value::Object(document.clone()))
            .send()
            .await
            .map_err(|e| Error::Sink(format!("upserting {id}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(id, %status, "document store rejected upsert");
            return Err(Error::Sink(format!("upserting {id}: HTTP {status}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_url_shape() {
        let sink = HttpSink::new(HttpSinkConfig {
            endpoint: "http://localhost:9200/".to_string(),
            database: "telemetry".to_string(),
            container: "readings".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            sink.document_url("0-42"),
            "http://localhost:9200/telemetry/readings/0-42"
        );
    }
}
