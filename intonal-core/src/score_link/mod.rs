//! TCP link to the score-following service.
//!
//! A background reader forwards inbound messages to the engine's event
//! channel; a writer thread reports performed notes back.

pub mod framing;

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::engine::EngineEvent;
use crate::predictive::{ScoreMessage, ScoreOutbound};

use framing::{read_message, write_message};

pub struct ScoreLink {
    stream: TcpStream,
    outbound_tx: Sender<ScoreOutbound>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl ScoreLink {
    pub fn connect(addr: &str, events: Sender<EngineEvent>) -> io::Result<Self> {
        log::info!(target: "score_link", "connecting to score follower at {}", addr);
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;
        let write_stream = stream.try_clone()?;

        let reader = thread::spawn(move || {
            reader_loop(BufReader::new(read_stream), events);
        });

        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        let writer = thread::spawn(move || {
            writer_loop(BufWriter::new(write_stream), outbound_rx);
        });

        Ok(Self {
            stream,
            outbound_tx,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Sender for performed-note reports; hand it to the engine.
    pub fn outbound(&self) -> Sender<ScoreOutbound> {
        self.outbound_tx.clone()
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        // The writer exits once every outbound sender is gone or a write fails.
        self.writer.take();
    }
}

impl Drop for ScoreLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read frames until EOF or a transport error, then report the closure.
/// Frames that fail to decode are skipped.
pub fn reader_loop<R: Read>(mut reader: R, events: Sender<EngineEvent>) {
    loop {
        match read_message::<_, ScoreMessage>(&mut reader) {
            Ok(msg) => {
                if events.send(EngineEvent::Score(msg)).is_err() {
                    // Engine gone
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                log::debug!(target: "score_link", "ignoring malformed message: {}", e);
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    log::warn!(target: "score_link", "score link read error: {}", e);
                } else {
                    log::info!(target: "score_link", "score follower disconnected");
                }
                let _ = events.send(EngineEvent::ScoreLinkClosed);
                return;
            }
        }
    }
}

fn writer_loop<W: Write>(mut writer: W, outbound: Receiver<ScoreOutbound>) {
    for msg in outbound {
        if let Err(e) = write_message(&mut writer, &msg) {
            log::debug!(target: "score_link", "score link write failed: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame(json: &str) -> Vec<u8> {
        let mut buf = (json.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(json.as_bytes());
        buf
    }

    #[test]
    fn forwards_messages_then_reports_closure() {
        let mut stream = frame(r#"{"type": "key_override", "key": "G"}"#);
        stream.extend(frame("not json"));
        stream.extend(frame(r#"{"type": "reset"}"#));

        let (tx, rx) = crossbeam_channel::unbounded();
        reader_loop(Cursor::new(stream), tx);

        let events: Vec<EngineEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            EngineEvent::Score(ScoreMessage::KeyOverride { key: Some(k), .. }) if k == "G"
        ));
        assert!(matches!(events[1], EngineEvent::Score(ScoreMessage::Reset)));
        assert!(matches!(events[2], EngineEvent::ScoreLinkClosed));
    }

    #[test]
    fn writer_frames_outbound_notes() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(ScoreOutbound::MidiNote {
            pitch: 64,
            velocity: 80,
            timestamp: 1.5,
        })
        .unwrap();
        drop(tx);

        let mut buf = Vec::new();
        writer_loop(&mut buf, rx);
        let msg: ScoreOutbound = read_message(&mut Cursor::new(buf)).unwrap();
        assert_eq!(
            msg,
            ScoreOutbound::MidiNote {
                pitch: 64,
                velocity: 80,
                timestamp: 1.5
            }
        );
    }
}
