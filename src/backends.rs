//! Remote parsing backends.
//!
//! The secondary parser and OCR service are accelerator-bound HTTP services
//! that read the file from shared storage. Both take `{file_path}` and
//! answer with extracted text plus their own quality score:
//!
//! ```text
//! secondary: {file_path} -> {text, quality_score}
//! ocr:       {file_path} -> {text, quality_score, pages_processed}
//! ```
//!
//! Callers hold the [`ResourceLock`](crate::lock::ResourceLock) around
//! every call; the clients here do no locking of their own.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::models::Backend;

/// Output of a remote backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteExtraction {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(default)]
    pub pages_processed: Option<u32>,
}

#[async_trait]
pub trait RemoteParser: Send + Sync {
    fn backend(&self) -> Backend;

    async fn parse(&self, file_path: &Path) -> Result<RemoteExtraction>;
}

/// JSON-over-HTTP client for either remote backend.
pub struct HttpRemoteParser {
    backend: Backend,
    url: String,
    client: reqwest::Client,
}

impl HttpRemoteParser {
    pub fn new(backend: Backend, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::RemoteBackendUnavailable(e.to_string()))?;
        Ok(Self {
            backend,
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl RemoteParser for HttpRemoteParser {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn parse(&self, file_path: &Path) -> Result<RemoteExtraction> {
        let body = serde_json::json!({ "file_path": file_path.to_string_lossy() });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::parse(self.backend, format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::parse(
                self.backend,
                format!("HTTP {}: {}", status, body_text),
            ));
        }

        let mut out: RemoteExtraction = response
            .json()
            .await
            .map_err(|e| PipelineError::parse(self.backend, format!("invalid response: {}", e)))?;
        out.quality_score = out.quality_score.clamp(0.0, 1.0);
        Ok(out)
    }
}
