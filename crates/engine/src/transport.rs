//! Seam between the orchestrator and the request client.

use async_trait::async_trait;
use kontext_api::{ApiError, ApiResponse, FormPayload, PipelineClient};

/// How the orchestrator issues stage requests. Production uses the real
/// [`PipelineClient`]; tests inject scripted fakes.
#[async_trait]
pub trait StageTransport: Send + Sync {
    async fn post(&self, path: &str, payload: &FormPayload) -> Result<ApiResponse, ApiError>;
}

#[async_trait]
impl StageTransport for PipelineClient {
    async fn post(&self, path: &str, payload: &FormPayload) -> Result<ApiResponse, ApiError> {
        PipelineClient::post(self, path, payload).await
    }
}
