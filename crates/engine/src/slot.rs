//! The single-concurrency pipeline run slot.
//!
//! A [`PipelineSlot`] owns the run state for one pipeline: the current
//! [`RunPhase`], the active run's cancel trigger, the Stage1 cache, and the
//! last final artifact. At most one run is in flight per slot; a second
//! `generate`/`refine` while one is active fails with
//! [`EngineError::RunAlreadyActive`] and leaves the active run untouched.
//!
//! Cancellation is cooperative. Every network await races the run's watch
//! trigger in a `biased` select with the trigger polled first, so when both
//! the response and the trigger are ready in the same tick, cancellation
//! wins. Terminal effects are only applied while the slot is still in a
//! running phase, which suppresses the loser of that race.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tracing::{info, warn};

use kontext_api::FormPayload;
use kontext_types::{
    Artifact, InputSignature, RunEvent, RunOutcome, RunPhase, SourceImage, StageLabel, Surface,
};

use crate::error::EngineError;
use crate::fetch::BlobFetcher;
use crate::timer::TimerRegistry;
use crate::transport::StageTransport;

const FLUX_RUN_PATH: &str = "/flux/run";
const NANO_PROCESS_PATH: &str = "/nano/process";
const FLUX_REFINE_PATH: &str = "/flux/refine";

/// Default diffusion step count for both generate and refine.
pub const DEFAULT_STEPS: u32 = 8;
/// Default positive prompt for the refine pass.
pub const DEFAULT_REFINE_PROMPT: &str = "nnps";

/// Inputs for one generate run. Both source images are required by
/// construction; there is no partial-input state to guard against.
#[derive(Clone, Debug)]
pub struct GenerateRequest {
    pub surface: Surface,
    pub character: SourceImage,
    pub garment: SourceImage,
    pub flux_prompt: String,
    pub nano_prompt: String,
    pub steps: u32,
}

impl GenerateRequest {
    pub fn new(character: SourceImage, garment: SourceImage) -> Self {
        Self {
            surface: Surface::Step1,
            character,
            garment,
            flux_prompt: String::new(),
            nano_prompt: String::new(),
            steps: DEFAULT_STEPS,
        }
    }
}

/// Inputs for one refine run over the slot's last final artifact.
#[derive(Clone, Debug)]
pub struct RefineRequest {
    pub surface: Surface,
    pub prompt: String,
    pub strength: f64,
    pub steps: u32,
    pub cfg: f64,
    pub denoise: f64,
    pub base: String,
}

impl Default for RefineRequest {
    fn default() -> Self {
        Self {
            surface: Surface::Step2,
            prompt: DEFAULT_REFINE_PROMPT.to_string(),
            strength: 0.85,
            steps: DEFAULT_STEPS,
            cfg: 1.0,
            denoise: 0.4,
            base: String::new(),
        }
    }
}

/// Artifacts produced by a successful generate run.
#[derive(Clone, Debug)]
pub struct GenerateOutcome {
    pub half: Artifact,
    pub final_image: Artifact,
}

/// Clonable cancel trigger bound to one run. Cancelling a settled run is a
/// no-op; the slot clears the trigger the moment the run settles.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    trigger: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.trigger.send(true);
    }
}

#[derive(Default)]
struct SlotState {
    phase: RunPhase,
    cancel: Option<watch::Sender<bool>>,
    stage_one_cache: Option<(InputSignature, Artifact)>,
    last_final: Option<Artifact>,
}

struct SlotInner {
    transport: Arc<dyn StageTransport>,
    fetcher: Arc<dyn BlobFetcher>,
    timers: TimerRegistry,
    events: UnboundedSender<RunEvent>,
    state: Mutex<SlotState>,
}

/// Clonable handle to one pipeline run slot.
#[derive(Clone)]
pub struct PipelineSlot {
    inner: Arc<SlotInner>,
}

impl PipelineSlot {
    pub fn new(
        transport: Arc<dyn StageTransport>,
        fetcher: Arc<dyn BlobFetcher>,
        events: UnboundedSender<RunEvent>,
    ) -> Self {
        let timers = TimerRegistry::new(events.clone());
        Self {
            inner: Arc::new(SlotInner {
                transport,
                fetcher,
                timers,
                events,
                state: Mutex::new(SlotState::default()),
            }),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.state().phase
    }

    /// Cancel trigger for the active run, if one is in flight.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.state().cancel.as_ref().map(|trigger| CancelHandle {
            trigger: trigger.clone(),
        })
    }

    /// Cancel the active run. Returns false when the slot is idle.
    pub fn cancel(&self) -> bool {
        match self.state().cancel.as_ref() {
            Some(trigger) => {
                let _ = trigger.send(true);
                true
            }
            None => false,
        }
    }

    /// Last final artifact produced (or seeded) on this slot.
    pub fn last_artifact(&self) -> Option<Artifact> {
        self.state().last_final.clone()
    }

    /// Install a final artifact without running the pipeline, so refine can
    /// start from an externally supplied image.
    pub fn seed_final_artifact(&self, artifact: Artifact) {
        self.state().last_final = Some(artifact);
    }

    /// Run the two-stage generate workflow to completion.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateOutcome, EngineError> {
        let mut cancel = self.begin_generate()?;
        info!(step = %request.surface, steps = request.steps, "generate run starting");
        let result = self.run_generate(&request, &mut cancel).await;
        self.settle(request.surface, &result);
        result
    }

    /// Run the refine workflow over the last final artifact.
    ///
    /// Refine is single-stage, so it reports as `Stage1Running` for its
    /// whole duration; `Stage2Running` is only ever reached by `generate`.
    pub async fn refine(&self, request: RefineRequest) -> Result<Artifact, EngineError> {
        let (mut cancel, prior) = self.begin_refine()?;
        info!(step = %request.surface, strength = request.strength, "refine run starting");
        let result = self.run_refine(&request, prior, &mut cancel).await;
        self.settle(request.surface, &result);
        result
    }

    fn begin_generate(&self) -> Result<watch::Receiver<bool>, EngineError> {
        let mut state = self.state();
        if state.cancel.is_some() {
            return Err(EngineError::RunAlreadyActive);
        }
        let (trigger, receiver) = watch::channel(false);
        state.cancel = Some(trigger);
        state.phase = RunPhase::Stage1Running;
        Ok(receiver)
    }

    fn begin_refine(&self) -> Result<(watch::Receiver<bool>, Artifact), EngineError> {
        let mut state = self.state();
        if state.cancel.is_some() {
            return Err(EngineError::RunAlreadyActive);
        }
        let prior = state
            .last_final
            .clone()
            .ok_or(EngineError::MissingPriorResult)?;
        let (trigger, receiver) = watch::channel(false);
        state.cancel = Some(trigger);
        state.phase = RunPhase::Stage1Running;
        Ok((receiver, prior))
    }

    async fn run_generate(
        &self,
        request: &GenerateRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<GenerateOutcome, EngineError> {
        let surface = request.surface;
        self.send(RunEvent::RunStarted {
            surface,
            at: Utc::now(),
        });
        self.send(RunEvent::Loading {
            surface,
            message: "Generating...".to_string(),
        });
        self.inner.timers.start(surface, StageLabel::Total);
        self.inner.timers.start(surface, StageLabel::Flux);

        let half = match self.stage_one(request, cancel).await {
            Ok(half) => half,
            Err(error) => return Err(self.stage_failed(surface, StageLabel::Flux, error)),
        };
        // The Flux timer stops "completed" on the cache-hit path too; the
        // cache is an optimization, not an observable shortcut.
        self.inner
            .timers
            .stop(surface, StageLabel::Flux, Some("completed"));
        self.send(RunEvent::StageFinished {
            surface,
            stage: StageLabel::Flux,
            outcome: RunOutcome::Completed,
        });
        self.set_phase(RunPhase::Stage2Running);

        self.inner.timers.start(surface, StageLabel::Nano);
        let final_image = match self.stage_two(request, &half, cancel).await {
            Ok(image) => image,
            Err(error) => return Err(self.stage_failed(surface, StageLabel::Nano, error)),
        };
        self.inner
            .timers
            .stop(surface, StageLabel::Nano, Some("completed"));
        self.send(RunEvent::StageFinished {
            surface,
            stage: StageLabel::Nano,
            outcome: RunOutcome::Completed,
        });
        self.inner
            .timers
            .stop(surface, StageLabel::Total, Some("completed"));

        self.state().last_final = Some(final_image.clone());
        self.send(RunEvent::ImageReady {
            surface,
            artifact: final_image.clone(),
        });
        Ok(GenerateOutcome { half, final_image })
    }

    async fn stage_one(
        &self,
        request: &GenerateRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Artifact, EngineError> {
        let surface = request.surface;
        if let Some(cached) = self.cached_half(&request.character.signature) {
            info!(step = %surface, signature = %request.character.signature, "stage one cache hit");
            self.send(RunEvent::Diagnostic {
                surface,
                line: "reusing cached half image".to_string(),
            });
            return Ok(cached);
        }

        let payload = FormPayload::new()
            .file(
                "main_image",
                request.character.data.clone(),
                request.character.file_name.clone(),
            )
            .text("flux_prompt", &request.flux_prompt)
            .text("steps", request.steps);
        let response = tokio::select! {
            biased;
            _ = cancel.changed() => return Err(EngineError::Cancelled),
            result = self.inner.transport.post(FLUX_RUN_PATH, &payload) => {
                result.map_err(|source| EngineError::Stage {
                    stage: StageLabel::Flux,
                    source,
                })?
            }
        };
        let url = response
            .str_field("halfImageUrl")
            .ok_or_else(|| EngineError::MalformedResponse {
                stage: StageLabel::Flux,
                detail: "missing halfImageUrl".to_string(),
            })?;
        let bytes = tokio::select! {
            biased;
            _ = cancel.changed() => return Err(EngineError::Cancelled),
            result = self.inner.fetcher.fetch(url) => {
                result.map_err(|source| EngineError::Fetch { source })?
            }
        };

        let half = Artifact::from_bytes(bytes);
        self.state().stage_one_cache = Some((request.character.signature.clone(), half.clone()));
        Ok(half)
    }

    async fn stage_two(
        &self,
        request: &GenerateRequest,
        half: &Artifact,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Artifact, EngineError> {
        let payload = FormPayload::new()
            .file("half_image", half.clone(), "half.png")
            .file(
                "ref_images",
                request.garment.data.clone(),
                request.garment.file_name.clone(),
            )
            .text("prompt", &request.nano_prompt);
        let response = tokio::select! {
            biased;
            _ = cancel.changed() => return Err(EngineError::Cancelled),
            result = self.inner.transport.post(NANO_PROCESS_PATH, &payload) => {
                result.map_err(|source| EngineError::Stage {
                    stage: StageLabel::Nano,
                    source,
                })?
            }
        };
        decode_image_field(&response, StageLabel::Nano)
    }

    async fn run_refine(
        &self,
        request: &RefineRequest,
        prior: Artifact,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Artifact, EngineError> {
        let surface = request.surface;
        self.send(RunEvent::RunStarted {
            surface,
            at: Utc::now(),
        });
        self.send(RunEvent::Loading {
            surface,
            message: "Refining...".to_string(),
        });
        self.inner.timers.start(surface, StageLabel::Total);

        let payload = FormPayload::new()
            .file("image", prior, "final.png")
            .text("strength", request.strength)
            .text("steps", request.steps)
            .text("cfg", request.cfg)
            .text("denoise", request.denoise)
            .text("prompt_text", &request.prompt)
            .text("base", &request.base);
        let refined = tokio::select! {
            biased;
            _ = cancel.changed() => Err(EngineError::Cancelled),
            result = self.inner.transport.post(FLUX_REFINE_PATH, &payload) => {
                result
                    .map_err(|source| EngineError::Stage {
                        stage: StageLabel::Flux,
                        source,
                    })
                    .and_then(|response| decode_image_field(&response, StageLabel::Flux))
            }
        };
        let refined = match refined {
            Ok(refined) => refined,
            Err(error) => return Err(self.stage_failed(surface, StageLabel::Total, error)),
        };
        self.inner
            .timers
            .stop(surface, StageLabel::Total, Some("completed"));

        self.state().last_final = Some(refined.clone());
        self.send(RunEvent::ImageReady {
            surface,
            artifact: refined.clone(),
        });
        Ok(refined)
    }

    /// Stop the failing stage's timer and `Total`, and report the failure.
    /// Stopping `Total` twice is harmless; the second stop is a no-op.
    fn stage_failed(
        &self,
        surface: Surface,
        stage: StageLabel,
        error: EngineError,
    ) -> EngineError {
        self.inner.timers.stop(surface, stage, Some("failed"));
        self.inner
            .timers
            .stop(surface, StageLabel::Total, Some("failed"));
        let outcome = match &error {
            EngineError::Cancelled => {
                info!(step = %surface, stage = %stage, "run cancelled");
                self.send(RunEvent::Diagnostic {
                    surface,
                    line: "cancelled by user".to_string(),
                });
                RunOutcome::Cancelled
            }
            error => {
                warn!(step = %surface, stage = %stage, error = %error, "stage failed");
                self.send(RunEvent::Error {
                    surface,
                    message: error.to_string(),
                });
                RunOutcome::Failed
            }
        };
        self.send(RunEvent::StageFinished {
            surface,
            stage,
            outcome,
        });
        error
    }

    /// Apply terminal effects for a finished run, unless something already
    /// settled the slot (the losing side of the success/cancel race).
    fn settle<T>(&self, surface: Surface, result: &Result<T, EngineError>) {
        let status = match result {
            Ok(_) => RunOutcome::Completed,
            Err(EngineError::Cancelled) => RunOutcome::Cancelled,
            Err(_) => RunOutcome::Failed,
        };
        {
            let mut state = self.state();
            if !state.phase.is_running() {
                return;
            }
            state.phase = match status {
                RunOutcome::Completed => RunPhase::Completed,
                RunOutcome::Failed => RunPhase::Failed,
                RunOutcome::Cancelled => RunPhase::Cancelled,
            };
            state.cancel = None;
        }
        self.inner.timers.release(surface);
        self.send(RunEvent::RunCompleted {
            surface,
            status,
            finished_at: Utc::now(),
        });
        info!(step = %surface, status = %status, "run settled");
    }

    fn set_phase(&self, phase: RunPhase) {
        let mut state = self.state();
        if state.phase.is_running() {
            state.phase = phase;
        }
    }

    fn cached_half(&self, signature: &InputSignature) -> Option<Artifact> {
        let state = self.state();
        state
            .stage_one_cache
            .as_ref()
            .filter(|(cached, _)| cached == signature)
            .map(|(_, artifact)| artifact.clone())
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.inner.state.lock().expect("slot state lock poisoned")
    }

    fn send(&self, event: RunEvent) {
        let _ = self.inner.events.send(event);
    }
}

/// Extract and decode the `imageBase64` payload of a stage response.
fn decode_image_field(
    response: &kontext_api::ApiResponse,
    stage: StageLabel,
) -> Result<Artifact, EngineError> {
    let encoded = response
        .str_field("imageBase64")
        .ok_or_else(|| EngineError::MalformedResponse {
            stage,
            detail: "missing imageBase64".to_string(),
        })?;
    Artifact::from_data_url(encoded).map_err(|source| EngineError::MalformedResponse {
        stage,
        detail: source.to_string(),
    })
}
