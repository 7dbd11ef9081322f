//! Run status reporting.
//!
//! The sequencer publishes [`SequencerEvent`]s through a [`StatusReporter`].
//! Reporters must return quickly; they are called inline from the sequencing
//! task and from burst progress callbacks.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;

/// Sequencer phase, identified by a fixed key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Weighing the sample.
    Scale,
    /// Configuring and starting the camera.
    InitCamera,
    /// LED burst.
    LedCapture,
    /// Lamp-off burst.
    NoiseCapture,
    /// Lamp warming up.
    PreheatLamp,
    /// Lamp-on burst.
    ImageCapture,
    /// Waiting for the next stage.
    Idle,
    /// Every stage ran.
    Complete,
}

impl Phase {
    /// Every phase, in key-table order.
    pub const ALL: [Phase; 8] = [
        Phase::Scale,
        Phase::InitCamera,
        Phase::LedCapture,
        Phase::NoiseCapture,
        Phase::PreheatLamp,
        Phase::ImageCapture,
        Phase::Idle,
        Phase::Complete,
    ];

    /// Status key shown to collaborators.
    pub fn key(self) -> &'static str {
        match self {
            Phase::Scale => "scale",
            Phase::InitCamera => "init_camera",
            Phase::LedCapture => "led_capture",
            Phase::NoiseCapture => "noise_capture",
            Phase::PreheatLamp => "preheat_lamp",
            Phase::ImageCapture => "image_capture",
            Phase::Idle => "idle",
            Phase::Complete => "complete",
        }
    }

    /// Human-readable status line.
    pub fn description(self) -> &'static str {
        match self {
            Phase::Scale => "Scaling the sample...",
            Phase::InitCamera => "Initializing camera...",
            Phase::LedCapture => "Capturing LED image",
            Phase::NoiseCapture => "Capturing noise...",
            Phase::PreheatLamp => "Preheating Lamp...",
            Phase::ImageCapture => "Capturing Illuminated Images...",
            Phase::Idle => "Idle...",
            Phase::Complete => "Experiment completed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Something a collaborator may want to show.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SequencerEvent {
    /// A new phase began.
    PhaseChanged {
        /// Phase entered.
        phase: Phase,
    },
    /// Frames still to capture in the current burst.
    BurstProgress {
        /// Phase running the burst.
        phase: Phase,
        /// Frames left, `0` once the burst completes.
        remaining: u32,
    },
    /// A stage ran to the end.
    StageCompleted {
        /// Stages finished so far.
        done: u32,
        /// Stages planned.
        total: u32,
    },
}

/// Receives sequencer events.
pub trait StatusReporter: Send + Sync {
    /// Handles one event. Must not block.
    fn report(&self, event: SequencerEvent);
}

/// Logs every event through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn report(&self, event: SequencerEvent) {
        match event {
            SequencerEvent::PhaseChanged { phase } => {
                info!(status = phase.key(), "{}", phase.description());
            }
            SequencerEvent::BurstProgress { phase, remaining } => {
                info!(status = phase.key(), remaining, "Images remaining");
            }
            SequencerEvent::StageCompleted { done, total } => {
                info!("Stages completed: {done} / {total}");
            }
        }
    }
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lag and lose old events; the sequencer never blocks on them.
#[derive(Clone, Debug)]
pub struct BroadcastReporter {
    tx: broadcast::Sender<SequencerEvent>,
}

impl BroadcastReporter {
    /// Keeps up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receives events reported after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.tx.subscribe()
    }
}

impl StatusReporter for BroadcastReporter {
    fn report(&self, event: SequencerEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Clone, Debug, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<SequencerEvent>>>,
}

impl RecordingReporter {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far, oldest first.
    pub fn events(&self) -> Vec<SequencerEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Phases in the order they were entered.
    pub fn phases(&self) -> Vec<Phase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SequencerEvent::PhaseChanged { phase } => Some(phase),
                _ => None,
            })
            .collect()
    }

    /// Remaining counts reported while in `phase`, across all bursts.
    pub fn progress_in(&self, phase: Phase) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SequencerEvent::BurstProgress { phase: p, remaining } if p == phase => {
                    Some(remaining)
                }
                _ => None,
            })
            .collect()
    }
}

impl StatusReporter for RecordingReporter {
    fn report(&self, event: SequencerEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Sends each event to every reporter in turn.
pub struct FanOut(pub Vec<Arc<dyn StatusReporter>>);

impl StatusReporter for FanOut {
    fn report(&self, event: SequencerEvent) {
        for reporter in &self.0 {
            reporter.report(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn keys_and_descriptions() {
        let keys: Vec<&str> = Phase::ALL.iter().map(|p| p.key()).collect();
        assert_eq!(
            keys,
            [
                "scale",
                "init_camera",
                "led_capture",
                "noise_capture",
                "preheat_lamp",
                "image_capture",
                "idle",
                "complete"
            ]
        );
        assert_eq!(Phase::ImageCapture.description(), "Capturing Illuminated Images...");
        assert_eq!(Phase::Complete.description(), "Experiment completed");
    }

    #[test]
    fn event_json() {
        let json = serde_json::to_value(SequencerEvent::BurstProgress {
            phase: Phase::NoiseCapture,
            remaining: 3,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "burst_progress", "phase": "noise_capture", "remaining": 3})
        );
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let reporter = BroadcastReporter::new(16);
        let mut rx = reporter.subscribe();
        reporter.report(SequencerEvent::PhaseChanged { phase: Phase::Idle });
        assert_eq!(
            rx.recv().await.unwrap(),
            SequencerEvent::PhaseChanged { phase: Phase::Idle }
        );
    }

    #[test]
    fn fan_out_and_recording() {
        let recorder = RecordingReporter::new();
        let fan = FanOut(vec![Arc::new(recorder.clone()), Arc::new(TracingReporter)]);
        fan.report(SequencerEvent::PhaseChanged { phase: Phase::Scale });
        fan.report(SequencerEvent::BurstProgress {
            phase: Phase::LedCapture,
            remaining: 1,
        });
        assert_eq!(recorder.phases(), vec![Phase::Scale]);
        assert_eq!(recorder.progress_in(Phase::LedCapture), vec![1]);
    }

    #[traced_test]
    #[test]
    fn tracing_reporter_logs_description() {
        TracingReporter.report(SequencerEvent::PhaseChanged {
            phase: Phase::PreheatLamp,
        });
        TracingReporter.report(SequencerEvent::StageCompleted { done: 1, total: 3 });
        assert!(logs_contain("Preheating Lamp..."));
        assert!(logs_contain("Stages completed: 1 / 3"));
    }
}
