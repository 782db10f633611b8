//! Workflow orchestration for the Kontext two-stage image pipeline.
//!
//! The engine drives the request client through the generate workflow (Flux
//! renders a half-resolution intermediate, NanoBanana composes the final
//! image) and the single-stage refine workflow. It owns per-slot run state,
//! cooperative cancellation, the Stage1 cache, and the per-stage elapsed-time
//! trackers, and reports progress over an unbounded [`RunEvent`] channel.
//!
//! [`RunEvent`]: kontext_types::RunEvent

pub mod error;
pub mod fetch;
pub mod slot;
pub mod timer;
pub mod transport;

pub use error::EngineError;
pub use fetch::{BlobFetcher, HttpBlobFetcher};
pub use slot::{
    CancelHandle, DEFAULT_REFINE_PROMPT, DEFAULT_STEPS, GenerateOutcome, GenerateRequest,
    PipelineSlot, RefineRequest,
};
pub use timer::TimerRegistry;
pub use transport::StageTransport;
