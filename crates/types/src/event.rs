//! Run lifecycle events emitted toward the presentation layer.
//!
//! The orchestrator and the timer registry push these over an unbounded Tokio
//! channel; the consumer (console viewer, CLI printer) owns the receiver.
//! Sends are fire-and-forget: a closed receiver never fails the workflow.

use chrono::{DateTime, Utc};

use crate::{Artifact, StageLabel, Surface};

/// Terminal status of a run, carried by [`RunEvent::RunCompleted`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One notification from an in-flight run.
#[derive(Clone, Debug)]
pub enum RunEvent {
    /// A workflow run began on the given surface.
    RunStarted { surface: Surface, at: DateTime<Utc> },
    /// The surface should show a loading state; resets any prior output.
    Loading { surface: Surface, message: String },
    /// One status-log line for the surface's diagnostic stream.
    Diagnostic { surface: Surface, line: String },
    /// A stage timer started tracking elapsed time.
    TimerStarted { surface: Surface, label: StageLabel },
    /// Periodic elapsed-time report for a running stage timer (every 5 s).
    TimerTick {
        surface: Surface,
        label: StageLabel,
        elapsed_secs: f64,
    },
    /// A stage timer stopped; `note` is the outcome annotation, if any.
    TimerStopped {
        surface: Surface,
        label: StageLabel,
        note: Option<String>,
        elapsed_secs: f64,
    },
    /// A stage produced its artifact and the run moved on.
    StageFinished {
        surface: Surface,
        stage: StageLabel,
        outcome: RunOutcome,
    },
    /// A final (or intermediate, for generate) image is ready to display.
    ImageReady { surface: Surface, artifact: Artifact },
    /// Human-readable failure summary for the surface. Diagnostic detail
    /// (attempt counts, raw statuses) stays on the tracing sink.
    Error { surface: Surface, message: String },
    /// The run settled; the slot is free again.
    RunCompleted {
        surface: Surface,
        status: RunOutcome,
        finished_at: DateTime<Utc>,
    },
}

impl RunEvent {
    /// Surface this event belongs to.
    pub fn surface(&self) -> Surface {
        match self {
            Self::RunStarted { surface, .. }
            | Self::Loading { surface, .. }
            | Self::Diagnostic { surface, .. }
            | Self::TimerStarted { surface, .. }
            | Self::TimerTick { surface, .. }
            | Self::TimerStopped { surface, .. }
            | Self::StageFinished { surface, .. }
            | Self::ImageReady { surface, .. }
            | Self::Error { surface, .. }
            | Self::RunCompleted { surface, .. } => *surface,
        }
    }

    /// Render the event as one status-log line, tagged with the surface.
    pub fn to_log_line(&self) -> String {
        match self {
            Self::RunStarted { surface, .. } => format!("{} run started", surface),
            Self::Loading { surface, message } => format!("{} {}", surface, message),
            Self::Diagnostic { surface, line } => format!("{} {}", surface, line),
            Self::TimerStarted { surface, label } => {
                format!("{} {} timer started", surface, label)
            }
            Self::TimerTick {
                surface,
                label,
                elapsed_secs,
            } => format!("{} {}: {:.1}s", surface, label, elapsed_secs),
            Self::TimerStopped {
                surface,
                label,
                note,
                elapsed_secs,
            } => match note {
                Some(note) => format!("{} {} {} ({:.1}s)", surface, label, note, elapsed_secs),
                None => format!("{} {}: {:.1}s", surface, label, elapsed_secs),
            },
            Self::StageFinished {
                surface,
                stage,
                outcome,
            } => format!("{} {} stage {}", surface, stage, outcome),
            Self::ImageReady { surface, artifact } => {
                format!("{} image ready ({} bytes)", surface, artifact.len())
            }
            Self::Error { surface, message } => format!("{} {}", surface, message),
            Self::RunCompleted {
                surface, status, ..
            } => format!("{} run {}", surface, status),
        }
    }
}
