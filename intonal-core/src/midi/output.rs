//! Outbound MIDI transports.
//!
//! `MidiSink` is what the protocol backends write to. `MidirSink` talks to a
//! real port; `CaptureSink` records everything for export and for tests.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use midir::{MidiOutput, MidiOutputConnection};

use super::MidiPortInfo;

/// Error from an outbound send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputError(pub String);

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OutputError {}

impl From<String> for OutputError {
    fn from(s: String) -> Self {
        OutputError(s)
    }
}

impl From<std::io::Error> for OutputError {
    fn from(e: std::io::Error) -> Self {
        OutputError(e.to_string())
    }
}

pub type OutputResult = Result<(), OutputError>;

/// A destination for MIDI 1.0 byte messages and, optionally, MIDI 2.0 UMP words.
pub trait MidiSink: Send {
    fn send(&mut self, message: &[u8]) -> OutputResult;

    fn send_ump(&mut self, _words: &[u32]) -> OutputResult {
        Err(OutputError("transport does not carry Universal MIDI Packets".into()))
    }

    fn supports_ump(&self) -> bool {
        false
    }
}

/// Connection to a midir output port.
pub struct MidirSink {
    connection: MidiOutputConnection,
    port_name: String,
}

impl MidirSink {
    pub fn connect(port_index: usize) -> Result<Self, OutputError> {
        let midi_out = MidiOutput::new("intonal").map_err(|e| OutputError(e.to_string()))?;
        let ports = midi_out.ports();
        let port = ports
            .get(port_index)
            .ok_or_else(|| OutputError(format!("Invalid port index: {}", port_index)))?;
        let port_name = midi_out
            .port_name(port)
            .unwrap_or_else(|_| "Unknown".to_string());
        let connection = midi_out
            .connect(port, "intonal-output")
            .map_err(|e| OutputError(e.to_string()))?;
        log::info!("MIDI output connected: {}", port_name);
        Ok(Self {
            connection,
            port_name,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

impl MidiSink for MidirSink {
    fn send(&mut self, message: &[u8]) -> OutputResult {
        self.connection
            .send(message)
            .map_err(|e| OutputError(e.to_string()))
    }
}

pub fn list_output_ports() -> Vec<MidiPortInfo> {
    let Ok(midi_out) = MidiOutput::new("intonal") else {
        return Vec::new();
    };
    midi_out
        .ports()
        .iter()
        .enumerate()
        .filter_map(|(index, port)| {
            midi_out
                .port_name(port)
                .ok()
                .map(|name| MidiPortInfo { index, name })
        })
        .collect()
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MidiSink for NullSink {
    fn send(&mut self, _message: &[u8]) -> OutputResult {
        Ok(())
    }
}

/// A message recorded by `CaptureSink`.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Bytes(Vec<u8>),
    Ump(Vec<u32>),
}

impl Sent {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Sent::Bytes(b) => Some(b),
            Sent::Ump(_) => None,
        }
    }

    pub fn is_sysex(&self) -> bool {
        matches!(self.bytes(), Some([0xF0, ..]))
    }

    /// Status nibble and channel of a channel-voice message.
    pub fn channel_message(&self) -> Option<(u8, u8)> {
        match self.bytes()? {
            [status, ..] if (0x80..0xF0).contains(status) => Some((status & 0xF0, status & 0x0F)),
            _ => None,
        }
    }
}

/// Records every message. Clones share the same log so a test can keep a
/// handle while the engine owns the sink.
#[derive(Debug, Clone)]
pub struct CaptureSink {
    log: Arc<Mutex<Vec<Sent>>>,
    fail_sysex: Arc<AtomicBool>,
    ump: bool,
}

impl CaptureSink {
    /// MIDI 1.0 only.
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            fail_sysex: Arc::new(AtomicBool::new(false)),
            ump: false,
        }
    }

    /// Also accepts UMP words.
    pub fn with_ump() -> Self {
        Self {
            ump: true,
            ..Self::new()
        }
    }

    /// Make every subsequent exclusive message fail, as a device that
    /// rejects SysEx would.
    pub fn fail_sysex(&self, fail: bool) {
        self.fail_sysex.store(fail, Ordering::Relaxed);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sent>> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn messages(&self) -> Vec<Sent> {
        self.lock().clone()
    }

    /// Drain and return everything recorded so far.
    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.lock())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn count<F: Fn(&Sent) -> bool>(&self, f: F) -> usize {
        self.lock().iter().filter(|m| f(m)).count()
    }
}

impl Default for CaptureSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiSink for CaptureSink {
    fn send(&mut self, message: &[u8]) -> OutputResult {
        if message.first() == Some(&0xF0) && self.fail_sysex.load(Ordering::Relaxed) {
            return Err(OutputError("SysEx rejected by device".into()));
        }
        self.lock().push(Sent::Bytes(message.to_vec()));
        Ok(())
    }

    fn send_ump(&mut self, words: &[u32]) -> OutputResult {
        if !self.ump {
            return Err(OutputError("transport does not carry Universal MIDI Packets".into()));
        }
        self.lock().push(Sent::Ump(words.to_vec()));
        Ok(())
    }

    fn supports_ump(&self) -> bool {
        self.ump
    }
}
