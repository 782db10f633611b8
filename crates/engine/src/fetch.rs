//! Resolving the Stage1 artifact URL to bytes.

use anyhow::Context;
use async_trait::async_trait;

/// Seam for downloading an artifact by URL. The orchestrator never packages
/// blobs itself; it hands the URL to this trait and works with the bytes.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>>;
}

/// Plain HTTP GET fetcher.
#[derive(Clone, Debug, Default)]
pub struct HttpBlobFetcher {
    http: reqwest::Client,
}

impl HttpBlobFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobFetcher for HttpBlobFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {url}"))?;
        Ok(bytes.to_vec())
    }
}
