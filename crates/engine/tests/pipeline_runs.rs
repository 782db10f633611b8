//! End-to-end orchestrator scenarios over scripted transports.
//!
//! These run on a paused Tokio clock so stage durations are exact virtual
//! time, letting the timer assertions check precise elapsed values.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use kontext_api::{ApiError, ApiResponse, FormPayload};
use kontext_engine::{
    BlobFetcher, EngineError, GenerateRequest, PipelineSlot, RefineRequest, StageTransport,
};
use kontext_types::{
    Artifact, RunEvent, RunOutcome, RunPhase, SourceImage, StageLabel, Surface,
};

struct Reply {
    delay: Duration,
    result: Result<ApiResponse, ApiError>,
}

/// Transport whose responses are scripted per path. An unscripted path
/// hangs forever, which stands in for a request the run must cancel out of.
#[derive(Default)]
struct ScriptedTransport {
    calls: Mutex<Vec<String>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
}

impl ScriptedTransport {
    fn script(&self, path: &str, delay: Duration, result: Result<ApiResponse, ApiError>) {
        self.replies
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(Reply { delay, result });
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageTransport for ScriptedTransport {
    async fn post(&self, path: &str, _payload: &FormPayload) -> Result<ApiResponse, ApiError> {
        self.calls.lock().unwrap().push(path.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(reply) => {
                tokio::time::sleep(reply.delay).await;
                reply.result
            }
            None => std::future::pending().await,
        }
    }
}

/// Transport whose response is held behind a gate, so a test can make the
/// response and another wakeup become ready in the same scheduling tick.
struct GatedTransport {
    gate: Arc<Notify>,
}

#[async_trait]
impl StageTransport for GatedTransport {
    async fn post(&self, _path: &str, _payload: &FormPayload) -> Result<ApiResponse, ApiError> {
        self.gate.notified().await;
        stage_one_reply()
    }
}

struct FakeFetcher {
    bytes: Vec<u8>,
    calls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl BlobFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.calls.lock().unwrap().push(url.to_string());
        Ok(self.bytes.clone())
    }
}

fn rig() -> (
    PipelineSlot,
    Arc<ScriptedTransport>,
    Arc<FakeFetcher>,
    UnboundedReceiver<RunEvent>,
) {
    let transport = Arc::new(ScriptedTransport::default());
    let fetcher = Arc::new(FakeFetcher::new(b"half-bytes"));
    let (tx, rx) = unbounded_channel();
    let slot = PipelineSlot::new(transport.clone(), fetcher.clone(), tx);
    (slot, transport, fetcher, rx)
}

fn generate_request() -> GenerateRequest {
    let character = SourceImage::new(vec![1u8; 64], "character.png");
    let garment = SourceImage::new(vec![2u8; 48], "garment.png");
    let mut request = GenerateRequest::new(character, garment);
    request.flux_prompt = "studio portrait".to_string();
    request.nano_prompt = "wear the garment".to_string();
    request
}

// "aGVsbG8=" is base64 for "hello".
fn stage_two_reply() -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::Json(json!({
        "imageBase64": "data:image/png;base64,aGVsbG8="
    })))
}

fn stage_one_reply() -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::Json(json!({
        "halfImageUrl": "http://backend/outputs/half.png"
    })))
}

fn drain(rx: &mut UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn timer_stops(events: &[RunEvent]) -> Vec<(StageLabel, Option<String>, f64)> {
    events
        .iter()
        .filter_map(|event| match event {
            RunEvent::TimerStopped {
                label,
                note,
                elapsed_secs,
                ..
            } => Some((*label, note.clone(), *elapsed_secs)),
            _ => None,
        })
        .collect()
}

async fn wait_for_call(transport: &ScriptedTransport, path: &str) {
    while !transport.calls().iter().any(|c| c == path) {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn generate_runs_both_stages_and_reports_total_time() {
    let (slot, transport, fetcher, mut rx) = rig();
    transport.script("/flux/run", Duration::from_millis(8500), stage_one_reply());
    transport.script("/nano/process", Duration::from_millis(15200), stage_two_reply());

    let outcome = slot.generate(generate_request()).await.unwrap();
    assert_eq!(outcome.half.as_bytes(), b"half-bytes");
    assert_eq!(outcome.final_image.as_bytes(), b"hello");
    assert_eq!(slot.phase(), RunPhase::Completed);
    assert_eq!(
        fetcher.calls.lock().unwrap().as_slice(),
        ["http://backend/outputs/half.png"]
    );

    let events = drain(&mut rx);

    let started: Vec<StageLabel> = events
        .iter()
        .filter_map(|event| match event {
            RunEvent::TimerStarted { label, .. } => Some(*label),
            _ => None,
        })
        .collect();
    assert_eq!(started, [StageLabel::Total, StageLabel::Flux, StageLabel::Nano]);

    // Nano only starts once Flux has stopped.
    let flux_stop = events
        .iter()
        .position(|e| matches!(e, RunEvent::TimerStopped { label: StageLabel::Flux, .. }))
        .unwrap();
    let nano_start = events
        .iter()
        .position(|e| matches!(e, RunEvent::TimerStarted { label: StageLabel::Nano, .. }))
        .unwrap();
    assert!(flux_stop < nano_start);

    let stops = timer_stops(&events);
    assert!(stops.contains(&(StageLabel::Flux, Some("completed".into()), 8.5)));
    assert!(stops.contains(&(StageLabel::Nano, Some("completed".into()), 15.2)));
    assert!(stops.contains(&(StageLabel::Total, Some("completed".into()), 23.7)));

    assert!(events.iter().any(|e| matches!(e, RunEvent::ImageReady { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::RunCompleted {
            status: RunOutcome::Completed,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn second_generate_is_refused_while_one_is_active() {
    let (slot, transport, _fetcher, _rx) = rig();
    transport.script("/flux/run", Duration::from_secs(3600), stage_one_reply());
    transport.script("/nano/process", Duration::ZERO, stage_two_reply());

    let first = tokio::spawn({
        let slot = slot.clone();
        async move { slot.generate(generate_request()).await }
    });
    wait_for_call(&transport, "/flux/run").await;

    let refused = slot.generate(generate_request()).await;
    assert!(matches!(refused, Err(EngineError::RunAlreadyActive)));
    // The active run is untouched and still completes.
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.final_image.as_bytes(), b"hello");
    assert_eq!(slot.phase(), RunPhase::Completed);
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_stage_one_stops_timers_and_skips_stage_two() {
    let (slot, transport, _fetcher, mut rx) = rig();
    // No script: the stage one request hangs until cancelled.

    let run = tokio::spawn({
        let slot = slot.clone();
        async move { slot.generate(generate_request()).await }
    });
    wait_for_call(&transport, "/flux/run").await;
    tokio::time::advance(Duration::from_millis(1200)).await;

    assert!(slot.cancel());
    let result = run.await.unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(slot.phase(), RunPhase::Cancelled);
    assert_eq!(transport.calls(), ["/flux/run"]);

    let events = drain(&mut rx);
    let stops = timer_stops(&events);
    assert!(stops.contains(&(StageLabel::Flux, Some("failed".into()), 1.2)));
    assert!(stops.contains(&(StageLabel::Total, Some("failed".into()), 1.2)));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Diagnostic { line, .. } if line == "cancelled by user"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::StageFinished {
            stage: StageLabel::Flux,
            outcome: RunOutcome::Cancelled,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::RunCompleted {
            status: RunOutcome::Cancelled,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn cancellation_wins_when_response_arrives_in_the_same_tick() {
    let gate = Arc::new(Notify::new());
    let transport = Arc::new(GatedTransport { gate: gate.clone() });
    let fetcher = Arc::new(FakeFetcher::new(b"half-bytes"));
    let (tx, _rx) = unbounded_channel();
    let slot = PipelineSlot::new(transport, fetcher, tx);

    let run = tokio::spawn({
        let slot = slot.clone();
        async move { slot.generate(generate_request()).await }
    });
    // Let the run reach the gated stage one request.
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }

    // Trigger the cancel and release the response before the run task is
    // polled again: both are ready in the same tick, and cancellation wins.
    assert!(slot.cancel());
    gate.notify_one();

    let result = run.await.unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(slot.phase(), RunPhase::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn unchanged_input_reuses_the_cached_half_image() {
    let (slot, transport, fetcher, mut rx) = rig();
    transport.script("/flux/run", Duration::ZERO, stage_one_reply());
    transport.script("/nano/process", Duration::ZERO, stage_two_reply());
    transport.script("/nano/process", Duration::ZERO, stage_two_reply());

    slot.generate(generate_request()).await.unwrap();
    drain(&mut rx);
    slot.generate(generate_request()).await.unwrap();

    // Stage one ran once across both runs; stage two ran each time.
    assert_eq!(transport.calls(), ["/flux/run", "/nano/process", "/nano/process"]);
    assert_eq!(fetcher.calls.lock().unwrap().len(), 1);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::Diagnostic { line, .. } if line == "reusing cached half image"
    )));
    // The Flux timer still brackets the (instant) cache hit.
    let stops = timer_stops(&events);
    assert!(stops.contains(&(StageLabel::Flux, Some("completed".into()), 0.0)));
}

#[tokio::test(start_paused = true)]
async fn changed_input_invalidates_the_cache() {
    let (slot, transport, _fetcher, _rx) = rig();
    transport.script("/flux/run", Duration::ZERO, stage_one_reply());
    transport.script("/flux/run", Duration::ZERO, stage_one_reply());
    transport.script("/nano/process", Duration::ZERO, stage_two_reply());
    transport.script("/nano/process", Duration::ZERO, stage_two_reply());

    slot.generate(generate_request()).await.unwrap();
    let mut changed = generate_request();
    changed.character = SourceImage::new(vec![1u8; 65], "character.png");
    slot.generate(changed).await.unwrap();

    let flux_calls = transport.calls().iter().filter(|c| *c == "/flux/run").count();
    assert_eq!(flux_calls, 2);
}

#[tokio::test(start_paused = true)]
async fn stage_failure_settles_the_run_as_failed() {
    let (slot, transport, _fetcher, mut rx) = rig();
    transport.script(
        "/flux/run",
        Duration::ZERO,
        Err(ApiError::Status {
            path: "/flux/run".to_string(),
            status: 500,
            body: "boom".to_string(),
        }),
    );

    let result = slot.generate(generate_request()).await;
    match result {
        Err(EngineError::Stage { stage, .. }) => assert_eq!(stage, StageLabel::Flux),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(slot.phase(), RunPhase::Failed);

    let events = drain(&mut rx);
    let stops = timer_stops(&events);
    assert!(stops.iter().any(|(label, note, _)| {
        *label == StageLabel::Flux && note.as_deref() == Some("failed")
    }));
    assert!(stops.iter().any(|(label, note, _)| {
        *label == StageLabel::Total && note.as_deref() == Some("failed")
    }));
    assert!(events.iter().any(|e| matches!(e, RunEvent::Error { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::StageFinished {
            stage: StageLabel::Flux,
            outcome: RunOutcome::Failed,
            ..
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::RunCompleted {
            status: RunOutcome::Failed,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn missing_response_field_is_a_malformed_response() {
    let (slot, transport, _fetcher, _rx) = rig();
    transport.script(
        "/flux/run",
        Duration::ZERO,
        Ok(ApiResponse::Json(json!({ "status": "ok" }))),
    );

    let result = slot.generate(generate_request()).await;
    match result {
        Err(EngineError::MalformedResponse { stage, detail }) => {
            assert_eq!(stage, StageLabel::Flux);
            assert!(detail.contains("halfImageUrl"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(slot.phase(), RunPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn refine_requires_a_prior_result() {
    let (slot, transport, _fetcher, _rx) = rig();
    let result = slot.refine(RefineRequest::default()).await;
    assert!(matches!(result, Err(EngineError::MissingPriorResult)));
    assert!(transport.calls().is_empty());
    assert_eq!(slot.phase(), RunPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn refine_reworks_the_last_final_artifact() {
    let (slot, transport, _fetcher, mut rx) = rig();
    transport.script("/flux/refine", Duration::from_secs(2), stage_two_reply());
    slot.seed_final_artifact(Artifact::from_bytes(b"prior".to_vec()));

    let refined = slot.refine(RefineRequest::default()).await.unwrap();
    assert_eq!(refined.as_bytes(), b"hello");
    assert_eq!(slot.phase(), RunPhase::Completed);
    assert_eq!(transport.calls(), ["/flux/refine"]);
    assert_eq!(slot.last_artifact().unwrap().as_bytes(), b"hello");

    let events = drain(&mut rx);
    let stops = timer_stops(&events);
    assert_eq!(stops, [(StageLabel::Total, Some("completed".into()), 2.0)]);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::ImageReady {
            surface: Surface::Step2,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn refine_can_be_cancelled() {
    let (slot, transport, _fetcher, _rx) = rig();
    slot.seed_final_artifact(Artifact::from_bytes(b"prior".to_vec()));
    // No script: the refine request hangs until cancelled.

    let run = tokio::spawn({
        let slot = slot.clone();
        async move { slot.refine(RefineRequest::default()).await }
    });
    wait_for_call(&transport, "/flux/refine").await;
    // The single-stage refine flow reports as stage 1 while in flight.
    assert_eq!(slot.phase(), RunPhase::Stage1Running);

    let handle = slot.cancel_handle().expect("run is active");
    handle.cancel();
    let result = run.await.unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(slot.phase(), RunPhase::Cancelled);
    // The seeded artifact survives a cancelled refine.
    assert_eq!(slot.last_artifact().unwrap().as_bytes(), b"prior");
}
