//! Per-surface stage timers with periodic elapsed-time reporting.
//!
//! Each timer is keyed by `(Surface, StageLabel)` so the three trackers of a
//! run (`Total`, `Flux`, `Nano`) never collide across surfaces or with each
//! other. Reporting is observational: a reporter task emits a `TimerTick`
//! every five seconds, and nothing in here can block or fail a workflow.
//!
//! Ownership is explicit. Timers are removed by [`TimerRegistry::stop`] or
//! torn down wholesale by [`TimerRegistry::release`] when a run settles;
//! entries never rely on implicit finalization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use kontext_types::{RunEvent, StageLabel, Surface};

/// Interval between periodic elapsed-time reports.
const REPORT_PERIOD: Duration = Duration::from_secs(5);

struct StageTimer {
    started_at: Instant,
    reporter: JoinHandle<()>,
}

/// Clonable handle over the timer table.
#[derive(Clone)]
pub struct TimerRegistry {
    timers: Arc<Mutex<HashMap<(Surface, StageLabel), StageTimer>>>,
    events: UnboundedSender<RunEvent>,
}

impl TimerRegistry {
    pub fn new(events: UnboundedSender<RunEvent>) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Start (or restart) the timer for `(surface, label)`.
    ///
    /// Restart is idempotent: an existing reporter for the key is aborted
    /// before the new one is spawned, so a key never has two reporters.
    pub fn start(&self, surface: Surface, label: StageLabel) {
        let started_at = Instant::now();
        let reporter = tokio::spawn({
            let events = self.events.clone();
            async move {
                let mut interval = tokio::time::interval_at(started_at + REPORT_PERIOD, REPORT_PERIOD);
                loop {
                    let now = interval.tick().await;
                    let elapsed_secs = round_tenths(now - started_at);
                    debug!(step = %surface, label = %label, elapsed_secs, "timer tick");
                    if events
                        .send(RunEvent::TimerTick {
                            surface,
                            label,
                            elapsed_secs,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });

        let replaced = self
            .lock()
            .insert((surface, label), StageTimer { started_at, reporter });
        if let Some(old) = replaced {
            old.reporter.abort();
        }

        info!(step = %surface, label = %label, "timer started");
        let _ = self.events.send(RunEvent::TimerStarted { surface, label });
    }

    /// Stop the timer for `(surface, label)` and report its elapsed time.
    ///
    /// An unknown key is a silent no-op: stopping a timer that never started
    /// emits nothing. Sibling labels on the surface are untouched.
    pub fn stop(&self, surface: Surface, label: StageLabel, note: Option<&str>) {
        let Some(timer) = self.lock().remove(&(surface, label)) else {
            return;
        };
        timer.reporter.abort();
        let elapsed_secs = round_tenths(timer.started_at.elapsed());

        info!(step = %surface, label = %label, elapsed_secs, note = note.unwrap_or(""), "timer stopped");
        let _ = self.events.send(RunEvent::TimerStopped {
            surface,
            label,
            note: note.map(str::to_string),
            elapsed_secs,
        });
    }

    /// Tear down every timer for a surface without reporting. Called when a
    /// run settles so stray reporters never outlive their run.
    pub fn release(&self, surface: Surface) {
        let mut timers = self.lock();
        timers.retain(|(owner, _), timer| {
            if *owner == surface {
                timer.reporter.abort();
                false
            } else {
                true
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Surface, StageLabel), StageTimer>> {
        self.timers.lock().expect("timer table lock poisoned")
    }
}

/// Elapsed seconds rounded to one decimal, the registry's reporting unit.
fn round_tenths(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 10.0).round() / 10.0
}
