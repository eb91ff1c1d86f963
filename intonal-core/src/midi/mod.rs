pub mod output;

use midir::{MidiInput, MidiInputConnection};

pub use output::{
    list_output_ports, CaptureSink, MidiSink, MidirSink, NullSink, OutputError, OutputResult, Sent,
};

/// A parsed inbound MIDI message.
/// Timestamp is in microseconds from a driver-specific epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct MidiEvent {
    pub timestamp_us: u64,
    pub kind: MidiEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MidiEventKind {
    NoteOn {
        channel: u8,
        note: u8,
        velocity: u8,
    },
    NoteOff {
        channel: u8,
        note: u8,
    },
    ControlChange {
        channel: u8,
        controller: u8,
        value: u8,
    },
    PitchBend {
        channel: u8,
        /// -8192 (full down) to +8191 (full up), 0 = center
        value: i16,
    },
    /// Complete exclusive message including the F0/F7 framing.
    SysEx(Vec<u8>),
}

impl MidiEvent {
    pub fn new(timestamp_us: u64, kind: MidiEventKind) -> Self {
        Self { timestamp_us, kind }
    }
}

/// Controller number of the sustain pedal.
pub const CC_SUSTAIN: u8 = 64;
/// Controller number of All Notes Off.
pub const CC_ALL_NOTES_OFF: u8 = 123;

pub fn note_on(channel: u8, note: u8, velocity: u8) -> [u8; 3] {
    [0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F]
}

pub fn note_off(channel: u8, note: u8) -> [u8; 3] {
    [0x80 | (channel & 0x0F), note & 0x7F, 0]
}

pub fn control_change(channel: u8, controller: u8, value: u8) -> [u8; 3] {
    [0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F]
}

/// 14-bit pitch bend, 8192 = center.
pub fn pitch_bend(channel: u8, value: u16) -> [u8; 3] {
    let (lsb, msb) = intonal_types::tuning::bend::u14_bytes(value);
    [0xE0 | (channel & 0x0F), lsb, msb]
}

/// Information about an available MIDI port
#[derive(Debug, Clone)]
pub struct MidiPortInfo {
    pub index: usize,
    pub name: String,
}

/// Resolve a port argument given either as an index or as a case-insensitive
/// substring of the port name.
pub fn find_port(ports: &[MidiPortInfo], query: &str) -> Option<usize> {
    if let Ok(index) = query.parse::<usize>() {
        return ports.iter().find(|p| p.index == index).map(|p| p.index);
    }
    let needle = query.to_lowercase();
    ports
        .iter()
        .find(|p| p.name.to_lowercase().contains(&needle))
        .map(|p| p.index)
}

/// MIDI input manager
pub struct MidiInputManager {
    midi_in: Option<MidiInput>,
    connection: Option<MidiInputConnection<()>>,
    connected_port_name: Option<String>,
    available_ports: Vec<MidiPortInfo>,
}

impl MidiInputManager {
    pub fn new() -> Self {
        Self {
            midi_in: new_input(),
            connection: None,
            connected_port_name: None,
            available_ports: Vec::new(),
        }
    }

    pub fn refresh_ports(&mut self) {
        self.available_ports.clear();

        if let Some(ref midi_in) = self.midi_in {
            for (index, port) in midi_in.ports().iter().enumerate() {
                if let Ok(name) = midi_in.port_name(port) {
                    self.available_ports.push(MidiPortInfo { index, name });
                }
            }
        }
    }

    pub fn list_ports(&self) -> &[MidiPortInfo] {
        &self.available_ports
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connected_port_name(&self) -> Option<&str> {
        self.connected_port_name.as_deref()
    }

    /// Connect to an input port by index. Every parsed message is handed to
    /// `on_event` on midir's callback thread.
    pub fn connect<F>(&mut self, port_index: usize, mut on_event: F) -> Result<(), String>
    where
        F: FnMut(MidiEvent) + Send + 'static,
    {
        self.disconnect();

        // Connecting consumes the MidiInput, so build a fresh one
        let mut midi_in = MidiInput::new("intonal").map_err(|e| e.to_string())?;
        midi_in.ignore(midir::Ignore::Time);
        let ports = midi_in.ports();

        let port = ports
            .get(port_index)
            .ok_or_else(|| format!("Invalid port index: {}", port_index))?;
        let port_name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| "Unknown".to_string());

        let connection = midi_in
            .connect(
                port,
                "intonal-input",
                move |timestamp, message, _| {
                    if let Some(kind) = parse_midi_message(message) {
                        on_event(MidiEvent::new(timestamp, kind));
                    }
                },
                (),
            )
            .map_err(|e| e.to_string())?;

        log::info!("MIDI input connected: {}", port_name);
        self.connection = Some(connection);
        self.connected_port_name = Some(port_name);
        self.midi_in = new_input();

        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
        }
        self.connected_port_name = None;
    }
}

impl Default for MidiInputManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MidiInputManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn new_input() -> Option<MidiInput> {
    let mut midi_in = MidiInput::new("intonal").ok()?;
    // SysEx stays enabled: negotiation listens for identity and dump replies
    midi_in.ignore(midir::Ignore::Time);
    Some(midi_in)
}

/// Parse a raw MIDI message into a MidiEventKind
pub fn parse_midi_message(data: &[u8]) -> Option<MidiEventKind> {
    let (&status, rest) = data.split_first()?;

    if status == 0xF0 {
        return if data.last() == Some(&0xF7) && data.len() >= 2 {
            Some(MidiEventKind::SysEx(data.to_vec()))
        } else {
            None
        };
    }

    let channel = status & 0x0F;
    match status & 0xF0 {
        0x80 => match rest {
            [note, _, ..] => Some(MidiEventKind::NoteOff {
                channel,
                note: *note,
            }),
            _ => None,
        },
        // Note On with velocity 0 is a note off
        0x90 => match rest {
            [note, 0, ..] => Some(MidiEventKind::NoteOff {
                channel,
                note: *note,
            }),
            [note, velocity, ..] => Some(MidiEventKind::NoteOn {
                channel,
                note: *note,
                velocity: *velocity,
            }),
            _ => None,
        },
        0xB0 => match rest {
            [controller, value, ..] => Some(MidiEventKind::ControlChange {
                channel,
                controller: *controller,
                value: *value,
            }),
            _ => None,
        },
        0xE0 => match rest {
            [lsb, msb, ..] => {
                let value = (((*msb as i16) << 7) | *lsb as i16) - 8192;
                Some(MidiEventKind::PitchBend { channel, value })
            }
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_note_on() {
        let event = parse_midi_message(&[0x91, 60, 100]).unwrap();
        assert_eq!(
            event,
            MidiEventKind::NoteOn {
                channel: 1,
                note: 60,
                velocity: 100
            }
        );
    }

    #[test]
    fn test_parse_note_on_velocity_zero() {
        let event = parse_midi_message(&[0x90, 60, 0]).unwrap();
        assert!(matches!(event, MidiEventKind::NoteOff { note: 60, .. }));
    }

    #[test]
    fn test_parse_pitch_bend() {
        let center = parse_midi_message(&[0xE0, 0x00, 0x40]).unwrap();
        assert_eq!(center, MidiEventKind::PitchBend { channel: 0, value: 0 });

        let up = parse_midi_message(&[0xE0, 0x7F, 0x7F]).unwrap();
        assert_eq!(up, MidiEventKind::PitchBend { channel: 0, value: 8191 });
    }

    #[test]
    fn test_parse_sustain_pedal() {
        let event = parse_midi_message(&[0xB0, CC_SUSTAIN, 127]).unwrap();
        assert!(matches!(
            event,
            MidiEventKind::ControlChange { controller: CC_SUSTAIN, value: 127, .. }
        ));
    }

    #[test]
    fn test_parse_sysex() {
        let reply = [0xF0, 0x7E, 0x10, 0x06, 0x02, 0x41, 0xF7];
        assert_eq!(
            parse_midi_message(&reply),
            Some(MidiEventKind::SysEx(reply.to_vec()))
        );
        // Unterminated exclusive message
        assert!(parse_midi_message(&[0xF0, 0x7E, 0x10]).is_none());
    }

    #[test]
    fn test_parse_short_and_unknown_messages() {
        assert!(parse_midi_message(&[]).is_none());
        assert!(parse_midi_message(&[0x90, 60]).is_none());
        assert!(parse_midi_message(&[0xE0, 0x00]).is_none());
        assert!(parse_midi_message(&[0xC0, 5]).is_none());
    }

    #[test]
    fn test_builders_mask_channel() {
        assert_eq!(note_on(17, 60, 100), [0x91, 60, 100]);
        assert_eq!(note_off(2, 61), [0x82, 61, 0]);
        assert_eq!(pitch_bend(3, 8192), [0xE3, 0x00, 0x40]);
        assert_eq!(control_change(0, CC_ALL_NOTES_OFF, 0), [0xB0, 123, 0]);
    }

    #[test]
    fn test_find_port_by_index_or_name() {
        let ports = vec![
            MidiPortInfo {
                index: 0,
                name: "Midi Through".into(),
            },
            MidiPortInfo {
                index: 1,
                name: "Surge XT MPE".into(),
            },
        ];
        assert_eq!(find_port(&ports, "1"), Some(1));
        assert_eq!(find_port(&ports, "surge"), Some(1));
        assert_eq!(find_port(&ports, "7"), None);
        assert_eq!(find_port(&ports, "pianoteq"), None);
    }
}
