//! Orchestrator error taxonomy.

use kontext_api::ApiError;
use kontext_types::StageLabel;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The slot already has a run in flight; concurrent runs are refused,
    /// never queued.
    #[error("a run is already active on this slot")]
    RunAlreadyActive,

    /// Refine was requested before any run produced a final artifact.
    #[error("no prior result available to refine")]
    MissingPriorResult,

    /// The run was cancelled by its cancel trigger.
    #[error("run cancelled")]
    Cancelled,

    /// A stage's request failed after the client's retries were spent.
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: StageLabel,
        #[source]
        source: ApiError,
    },

    /// A stage responded successfully but the expected field was absent or
    /// undecodable.
    #[error("{stage} stage returned a malformed response: {detail}")]
    MalformedResponse { stage: StageLabel, detail: String },

    /// The intermediate artifact URL could not be resolved to bytes.
    #[error("failed to fetch stage artifact: {source}")]
    Fetch {
        #[source]
        source: anyhow::Error,
    },
}
