//! # HTTP Export Source
//!
//! Consumer-side access to a running roster server. Implements
//! [`ExportSource`] over `reqwest`, so the same [`IntegrityPipeline`] that
//! tests drive in-process can verify a remote deployment.
//!
//! [`IntegrityPipeline`]: roster_integrity::pipeline::IntegrityPipeline

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use roster_integrity::config::EXPORT_CONTENT_TYPE;
use roster_integrity::crypto::PublicKeyInfo;
use roster_integrity::pipeline::{ExportSource, SourceError};

use crate::api::ApiResponse;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches the public key and export from a roster server's REST API.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    base_url: String,
}

impl HttpSource {
    /// Builds a client with a request timeout. Fails if the TLS backend
    /// cannot be initialized.
    pub fn new(base_url: &str) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str, accept: &str) -> Result<reqwest::Response, SourceError> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, accept)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Unavailable(format!("{url}: HTTP {status}")));
        }
        Ok(response)
    }
}

fn unavailable(url: &str, e: reqwest::Error) -> SourceError {
    SourceError::Unavailable(format!("{url}: {e}"))
}

#[async_trait]
impl ExportSource for HttpSource {
    async fn public_key(&self) -> Result<PublicKeyInfo, SourceError> {
        let response = self.get("/api/public-key", "application/json").await?;
        let envelope: ApiResponse<PublicKeyInfo> = response
            .json()
            .await
            .map_err(|e| unavailable(&self.url("/api/public-key"), e))?;

        match envelope {
            ApiResponse {
                success: true,
                data: Some(info),
                ..
            } => Ok(info),
            ApiResponse { error, .. } => Err(SourceError::Unavailable(
                error.unwrap_or_else(|| "public key response carried no data".to_string()),
            )),
        }
    }

    async fn export(&self) -> Result<Vec<u8>, SourceError> {
        let response = self.get("/api/users/export", EXPORT_CONTENT_TYPE).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| unavailable(&self.url("/api/users/export"), e))?;
        tracing::debug!(bytes = bytes.len(), "export downloaded");
        Ok(bytes.to_vec())
    }
}
