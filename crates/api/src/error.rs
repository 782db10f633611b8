//! Error taxonomy for the request client.
//!
//! Classification drives the retry loop: cold-start HTTP statuses and
//! connectivity-level transport failures are retryable, authorization and
//! every other failure are fatal. Connectivity is judged by the structured
//! error kind, never by matching message text.

use thiserror::Error;

/// Statuses treated as backend cold-start symptoms.
const COLD_START_STATUSES: [u16; 3] = [404, 502, 503];

#[derive(Debug, Error)]
pub enum ApiError {
    /// The request completed with a non-success HTTP status.
    #[error("POST {path} failed: {status} {body}")]
    Status { path: String, status: u16, body: String },

    /// The request could not be completed at all. `connectivity` records
    /// whether the failure happened before the request reached the server.
    #[error("POST {path} network error: {source}")]
    Transport {
        path: String,
        connectivity: bool,
        #[source]
        source: reqwest::Error,
    },

    /// The configured base URL failed validation.
    #[error("invalid base URL '{base}': {reason}")]
    InvalidBaseUrl { base: String, reason: String },

    /// The underlying HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },

    /// The response advertised JSON but the body did not parse.
    #[error("POST {path} returned undecodable JSON: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    /// Whether the retry loop may re-issue the request after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => COLD_START_STATUSES.contains(status),
            Self::Transport { connectivity, .. } => *connectivity,
            Self::InvalidBaseUrl { .. } | Self::Client { .. } | Self::Decode { .. } => false,
        }
    }

    /// HTTP status carried by this error, when it has one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn transport(path: &str, source: reqwest::Error) -> Self {
        let connectivity = source.is_connect() || source.is_timeout();
        Self::Transport {
            path: path.to_string(),
            connectivity,
            source,
        }
    }
}
