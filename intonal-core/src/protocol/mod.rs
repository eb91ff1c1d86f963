//! Tuning transports: three interchangeable backends behind one enum, plus
//! the capability negotiation that picks between them.

pub mod channel_pool;
pub mod highres;
pub mod mpe;
pub mod mts;
pub mod negotiation;
pub mod preference;

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use intonal_types::tuning::bend::BendRange;
use intonal_types::Tonality;

use crate::midi::{MidiSink, OutputError, OutputResult};

pub use channel_pool::SlotOwner;
use highres::HighResBackend;
use mpe::MpeBackend;
use mts::MtsBackend;

/// Which transport carries the tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "fine_sysex")]
    FineSysEx,
    #[serde(rename = "channel_rotation")]
    ChannelRotation,
    #[serde(rename = "high_res")]
    HighResFormat,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::FineSysEx => "fine_sysex",
            BackendKind::ChannelRotation => "channel_rotation",
            BackendKind::HighResFormat => "high_res",
        }
    }

    pub fn parse(s: &str) -> Option<BackendKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fine_sysex" | "sysex" | "mts" => Some(BackendKind::FineSysEx),
            "channel_rotation" | "mpe" => Some(BackendKind::ChannelRotation),
            "high_res" | "highres" | "midi2" => Some(BackendKind::HighResFormat),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Negotiated transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    Detecting,
    FineSysEx,
    ChannelRotation,
    HighResFormat,
    Unsupported,
}

impl ProtocolMode {
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            ProtocolMode::FineSysEx => Some(BackendKind::FineSysEx),
            ProtocolMode::ChannelRotation => Some(BackendKind::ChannelRotation),
            ProtocolMode::HighResFormat => Some(BackendKind::HighResFormat),
            ProtocolMode::Detecting | ProtocolMode::Unsupported => None,
        }
    }
}

impl From<BackendKind> for ProtocolMode {
    fn from(kind: BackendKind) -> Self {
        match kind {
            BackendKind::FineSysEx => ProtocolMode::FineSysEx,
            BackendKind::ChannelRotation => ProtocolMode::ChannelRotation,
            BackendKind::HighResFormat => ProtocolMode::HighResFormat,
        }
    }
}

/// What a backend needs to know about one sounding note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoteRef {
    pub id: u64,
    pub pitch: u8,
    pub velocity: u8,
    pub started_at: Instant,
}

/// Successful per-note tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Applied {
    pub cents: f64,
    /// The target had to be clamped to the representable range.
    pub clamped: bool,
    /// The preferred message failed and a coarser one was sent instead.
    pub fallback: bool,
    /// Note cut off to free a resource for this one.
    pub stolen: Option<SlotOwner>,
}

impl Applied {
    pub fn exact(cents: f64) -> Self {
        Self {
            cents,
            clamped: false,
            fallback: false,
            stolen: None,
        }
    }

    pub fn with_clamped(mut self, clamped: bool) -> Self {
        self.clamped = clamped;
        self
    }
}

/// Per-note tuning failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyError {
    /// No channel free and none old enough to steal.
    ResourceExhausted,
    /// The deviation can't be represented; nothing was sent for it.
    OutOfRange { cents: f64 },
    Transport(OutputError),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyError::ResourceExhausted => write!(f, "no tuning resource available"),
            ApplyError::OutOfRange { cents } => write!(f, "{:+.2} cents is out of range", cents),
            ApplyError::Transport(e) => write!(f, "transport failure: {}", e),
        }
    }
}

impl std::error::Error for ApplyError {}

impl From<OutputError> for ApplyError {
    fn from(e: OutputError) -> Self {
        ApplyError::Transport(e)
    }
}

/// Construction parameters shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendSettings {
    pub device_id: u8,
    pub tuning_program: u8,
    pub base_channel: u8,
    pub bend_range: BendRange,
    pub steal_guard: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            device_id: mts::BROADCAST_DEVICE,
            tuning_program: 0,
            base_channel: 0,
            bend_range: BendRange::MPE_DEFAULT,
            steal_guard: Duration::from_millis(30),
        }
    }
}

/// The active tuning transport.
pub enum TuningBackend {
    Mts(MtsBackend),
    Mpe(MpeBackend),
    HighRes(HighResBackend),
}

impl TuningBackend {
    pub fn new(kind: BackendKind, settings: &BackendSettings) -> Self {
        match kind {
            BackendKind::FineSysEx => TuningBackend::Mts(MtsBackend::new(
                settings.device_id,
                settings.tuning_program,
                settings.base_channel,
                settings.bend_range,
            )),
            BackendKind::ChannelRotation => {
                TuningBackend::Mpe(MpeBackend::new(settings.bend_range, settings.steal_guard))
            }
            BackendKind::HighResFormat => {
                TuningBackend::HighRes(HighResBackend::new(0, settings.base_channel))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            TuningBackend::Mts(_) => BackendKind::FineSysEx,
            TuningBackend::Mpe(_) => BackendKind::ChannelRotation,
            TuningBackend::HighRes(_) => BackendKind::HighResFormat,
        }
    }

    /// One-time setup when the backend becomes active.
    pub fn activate(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        match self {
            TuningBackend::Mpe(b) => b.activate(out),
            TuningBackend::Mts(_) | TuningBackend::HighRes(_) => Ok(()),
        }
    }

    pub fn apply_key_change(&mut self, out: &mut dyn MidiSink, key: Tonality) -> OutputResult {
        match self {
            TuningBackend::Mts(b) => b.apply_key_change(out, key),
            TuningBackend::Mpe(b) => b.apply_key_change(out, key),
            TuningBackend::HighRes(b) => b.apply_key_change(out, key),
        }
    }

    /// Tune one note. Called before its note-on and again whenever its
    /// deviation moves.
    pub fn apply_note(
        &mut self,
        out: &mut dyn MidiSink,
        note: &NoteRef,
        cents: f64,
    ) -> Result<Applied, ApplyError> {
        match self {
            TuningBackend::Mts(b) => b.apply_note(out, note, cents),
            TuningBackend::Mpe(b) => b.apply_note(out, note, cents),
            TuningBackend::HighRes(b) => b.apply_note(out, note, cents),
        }
    }

    pub fn note_on(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        match self {
            TuningBackend::Mts(b) => b.note_on(out, note),
            TuningBackend::Mpe(b) => b.note_on(out, note),
            TuningBackend::HighRes(b) => b.note_on(out, note),
        }
    }

    pub fn note_off(&mut self, out: &mut dyn MidiSink, note: &NoteRef) -> OutputResult {
        match self {
            TuningBackend::Mts(b) => b.note_off(out, note),
            TuningBackend::Mpe(b) => b.note_off(out, note),
            TuningBackend::HighRes(b) => b.note_off(out, note),
        }
    }

    /// Drop the note's tuning state and free its resource as of `now`.
    pub fn release_note(&mut self, out: &mut dyn MidiSink, note: &NoteRef, now: Instant) -> OutputResult {
        match self {
            TuningBackend::Mts(b) => b.release_note(out, note),
            TuningBackend::Mpe(b) => b.release_note(out, note, now),
            TuningBackend::HighRes(b) => b.release_note(out, note),
        }
    }

    pub fn control_change(&mut self, out: &mut dyn MidiSink, controller: u8, value: u8) -> OutputResult {
        match self {
            TuningBackend::Mts(b) => b.control_change(out, controller, value),
            TuningBackend::Mpe(b) => b.control_change(out, controller, value),
            TuningBackend::HighRes(b) => b.control_change(out, controller, value),
        }
    }

    /// Everything back to equal temperament and idle.
    pub fn reset(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        match self {
            TuningBackend::Mts(b) => b.reset(out),
            TuningBackend::Mpe(b) => b.reset(out),
            TuningBackend::HighRes(b) => b.reset(out),
        }
    }

    pub fn all_notes_off(&mut self, out: &mut dyn MidiSink) -> OutputResult {
        match self {
            TuningBackend::Mts(b) => b.all_notes_off(out),
            TuningBackend::Mpe(b) => b.all_notes_off(out),
            TuningBackend::HighRes(b) => b.all_notes_off(out),
        }
    }

    /// Point per-note SysEx at the device that answered the probe.
    pub fn set_device_id(&mut self, device_id: u8) {
        if let TuningBackend::Mts(b) = self {
            b.set_device_id(device_id);
        }
    }
}
