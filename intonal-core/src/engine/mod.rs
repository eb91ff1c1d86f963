//! The realtime retuning engine.
//!
//! [`Orchestrator`] owns all mutable tuning state and is driven by exactly one
//! thread ([`EngineHandle`] spawns it). Note and control events, score-link
//! messages and control commands arrive over channels; a fixed-rate tick
//! smooths the tuning table and re-pushes drifting notes.

mod handle;
mod orchestrator;
mod telemetry;
mod thread;

use std::fmt;
use std::sync::mpsc::Sender;
use std::time::Duration;

use intonal_types::tuning::bend::BendRange;
use intonal_types::{Sensitivity, Tonality};

use crate::key_detect::DetectorSettings;
use crate::midi::MidiEvent;
use crate::predictive::ScoreMessage;
use crate::protocol::BackendKind;

pub use handle::EngineHandle;
pub use orchestrator::{ActiveNote, NoteState, Orchestrator};
pub use telemetry::TickTelemetry;

/// Where tuned notes go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputTarget {
    /// Built-in synthesizer via a [`VoiceSink`].
    Internal,
    /// External MIDI device via the negotiated tuning backend.
    #[default]
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub sensitivity: Sensitivity,
    pub detector: DetectorSettings,
    pub reference_a4: f64,
    pub smoothing_min: f64,
    pub smoothing_max: f64,
    pub tick_interval: Duration,
    pub repush_interval: Duration,
    pub output_target: OutputTarget,
    pub bend_range: BendRange,
    pub base_channel: u8,
    pub steal_guard: Duration,
    pub probe_timeout: Duration,
    pub stale_after_secs: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sensitivity: Sensitivity::Medium,
            detector: DetectorSettings::default(),
            reference_a4: 440.0,
            smoothing_min: 0.08,
            smoothing_max: 0.35,
            tick_interval: Duration::from_millis(20),
            repush_interval: Duration::from_millis(100),
            output_target: OutputTarget::External,
            bend_range: BendRange::MPE_DEFAULT,
            base_channel: 0,
            steal_guard: Duration::from_millis(30),
            probe_timeout: Duration::from_millis(400),
            stale_after_secs: crate::predictive::DEFAULT_STALE_AFTER_SECS,
        }
    }
}

/// Receives tuned notes for internal synthesis. Never told which backend
/// produced the deviation.
pub trait VoiceSink: Send {
    fn note_on(&mut self, pitch: u8, velocity: u8, cents: f64);
    fn note_off(&mut self, pitch: u8);
    /// A sounding note's deviation moved.
    fn retune(&mut self, _pitch: u8, _cents: f64) {}
}

/// Inbound events, processed in arrival order.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Midi(MidiEvent),
    Score(ScoreMessage),
    ScoreLinkClosed,
}

/// Control-surface commands.
#[derive(Debug)]
pub enum EngineCmd {
    Start,
    /// Replies once every note is off and the backend is reset.
    Stop { reply: Sender<()> },
    Panic,
    SetSensitivity(Sensitivity),
    SetKeyOverride(Option<Tonality>),
    SetBackendOverride(Option<BackendKind>),
    SetScoreTap(Option<crossbeam_channel::Sender<crate::predictive::ScoreOutbound>>),
    Shutdown,
}

/// Where the current key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Manual,
    Score,
    Detected,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeySource::Manual => "manual",
            KeySource::Score => "score",
            KeySource::Detected => "detected",
        })
    }
}

/// Why a note didn't get its just-intonation deviation.
#[derive(Debug, Clone, PartialEq)]
pub enum Degradation {
    /// No channel free and none old enough to steal.
    ResourceExhausted,
    /// Deviation not representable by the active backend.
    OutOfRange { cents: f64 },
    /// The output device rejected a send.
    Transport(String),
    /// Preferred message failed; a coarser one carried the tuning.
    Fallback,
    /// Cut off to free a channel for a newer note.
    Stolen,
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::ResourceExhausted => write!(f, "no tuning resource available"),
            Degradation::OutOfRange { cents } => write!(f, "{:+.2} cents out of range", cents),
            Degradation::Transport(e) => write!(f, "transport failure: {}", e),
            Degradation::Fallback => write!(f, "fell back to pitch bend"),
            Degradation::Stolen => write!(f, "channel stolen"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningSource {
    Reactive,
    Predictive,
}

/// What happened to a note-on.
#[derive(Debug, Clone, PartialEq)]
pub enum NoteOutcome {
    Tuned {
        id: u64,
        cents: f64,
        freq_hz: f64,
        source: TuningSource,
    },
    /// Sounded, but untuned.
    EqualTemperament { id: u64, reason: Degradation },
    /// Not sounded at all.
    Dropped { id: u64, reason: Degradation },
    /// Engine stopped; the event was ignored.
    Ignored,
}

impl NoteOutcome {
    pub fn cents(&self) -> Option<f64> {
        match self {
            NoteOutcome::Tuned { cents, .. } => Some(*cents),
            NoteOutcome::EqualTemperament { .. } => Some(0.0),
            NoteOutcome::Dropped { .. } | NoteOutcome::Ignored => None,
        }
    }
}

/// Reported to the control surface.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineFeedback {
    KeyChanged {
        key: Option<Tonality>,
        source: Option<KeySource>,
        confidence: Option<f64>,
    },
    ModeChanged(BackendKind),
    NoteDropped { pitch: u8, reason: Degradation },
    Degraded { pitch: u8, reason: Degradation },
    Stopped,
    TickStats {
        avg_us: u32,
        max_us: u32,
        p95_us: u32,
        overruns: u64,
    },
}
