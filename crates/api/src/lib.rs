//! Kontext pipeline API client.
//!
//! A lightweight client for the pipeline backend, resilient to cold starts.
//! It focuses on:
//!
//! - Constructing an HTTP client with sensible defaults
//! - Validating the configured base URL
//! - Multipart POSTs that can be safely re-issued by the retry loop
//! - Classifying failures as retryable (cold start, connectivity) or fatal
//!
//! The primary entry point is [`PipelineClient`]. Create an instance via
//! [`PipelineClient::new`] or [`PipelineClient::from_env`], and issue
//! requests with [`PipelineClient::post`].
//!
//! # Example
//!
//! ```ignore
//! use kontext_api::{FormPayload, PipelineClient};
//!
//! # async fn run() -> Result<(), kontext_api::ApiError> {
//! let client = PipelineClient::new("http://127.0.0.1:9090")?;
//! let payload = FormPayload::new().text("steps", 8);
//! let response = client.post("/flux/run", &payload).await?;
//! println!("json: {}", response.json().is_some());
//! # Ok(())
//! # }
//! ```

use std::env;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use url::Url;

mod error;
mod form;
mod retry;

pub use error::ApiError;
pub use form::FormPayload;
pub use retry::RetryPolicy;

/// Environment variable overriding the backend base URL.
pub const BASE_URL_ENV: &str = "KONTEXT_BASE_URL";
/// Default backend base URL for local development.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:9090";

/// Decoded response body from a successful request.
#[derive(Clone, Debug)]
pub enum ApiResponse {
    /// Body declared `application/json` and parsed as such.
    Json(serde_json::Value),
    /// Any other content type, returned as raw text.
    Text(String),
}

impl ApiResponse {
    pub fn json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) => None,
        }
    }

    /// Pull a top-level string field out of a JSON response.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.json()?.get(name)?.as_str()
    }
}

/// Thin wrapper around a configured `reqwest::Client` for pipeline access.
///
/// Requests are resolved relative to a validated base URL and carry
/// credentials (cookies). Every POST goes through the bounded retry loop in
/// [`retry`], honoring the client's [`RetryPolicy`].
#[derive(Clone, Debug)]
pub struct PipelineClient {
    base_url: String,
    http: Client,
    policy: RetryPolicy,
}

impl PipelineClient {
    /// Construct a client with the default cold-start retry policy.
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_policy(base_url, RetryPolicy::default())
    }

    /// Construct a client with an explicit retry policy.
    pub fn with_policy(base_url: &str, policy: RetryPolicy) -> Result<Self, ApiError> {
        let base_url = validate_base_url(base_url)?;
        let http = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| ApiError::Client { source })?;
        Ok(Self {
            base_url,
            http,
            policy,
        })
    }

    /// Base URL from `KONTEXT_BASE_URL`, falling back to the local default.
    pub fn from_env() -> Result<Self, ApiError> {
        let base_url = env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(&base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a multipart payload to an API-relative path.
    ///
    /// Cold-start statuses (404/502/503) and connectivity failures are
    /// retried on the policy's schedule, re-issuing the identical body each
    /// time; the caller guarantees the resend is side-effect safe.
    /// Everything else fails on the first attempt.
    pub async fn post(&self, path: &str, payload: &FormPayload) -> Result<ApiResponse, ApiError> {
        retry::run_with_backoff(&self.policy, path, |_| self.post_once(path, payload)).await
    }

    async fn post_once(&self, path: &str, payload: &FormPayload) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, parts = payload.len(), "posting multipart form");

        let response = self
            .http
            .post(&url)
            .multipart(payload.to_form())
            .send()
            .await
            .map_err(|source| ApiError::transport(path, source))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));
        let text = response
            .text()
            .await
            .map_err(|source| ApiError::transport(path, source))?;

        if is_json {
            let value = serde_json::from_str(&text).map_err(|source| ApiError::Decode {
                path: path.to_string(),
                source,
            })?;
            Ok(ApiResponse::Json(value))
        } else {
            Ok(ApiResponse::Text(text))
        }
    }
}

/// Validate a base URL and normalize it (trailing slash trimmed).
///
/// Rules: must parse as a URL, must use http or https, and must include a
/// host. Anything reachable is otherwise acceptable; the backend may live on
/// localhost, a LAN box, or a hosted deployment.
fn validate_base_url(base: &str) -> Result<String, ApiError> {
    let invalid = |reason: &str| ApiError::InvalidBaseUrl {
        base: base.to_string(),
        reason: reason.to_string(),
    };

    let parsed = Url::parse(base).map_err(|e| invalid(&e.to_string()))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("URL must include a host"));
    }
    Ok(base.trim_end_matches('/').to_string())
}
