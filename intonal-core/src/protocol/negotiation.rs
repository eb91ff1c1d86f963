//! Capability negotiation.
//!
//! `Detecting` sends an identity request and a tuning dump request, then
//! waits a bounded time. Any reply promotes to fine SysEx and pins the
//! responding device id; silence demotes to channel rotation. Probing never
//! blocks: the caller keeps routing notes through its last-known backend
//! and polls for the outcome.

use std::time::{Duration, Instant};

use crate::midi::MidiSink;

use super::mts::{identity_request, parse_probe_reply, tuning_dump_request};
use super::{BackendKind, ProtocolMode};

pub struct Negotiator {
    mode: ProtocolMode,
    deadline: Option<Instant>,
    device_id: Option<u8>,
    timeout: Duration,
    tuning_program: u8,
}

impl Negotiator {
    pub fn new(timeout: Duration, tuning_program: u8) -> Self {
        Self {
            mode: ProtocolMode::Detecting,
            deadline: None,
            device_id: None,
            timeout,
            tuning_program,
        }
    }

    pub fn mode(&self) -> ProtocolMode {
        self.mode
    }

    /// Device id from the last probe reply.
    pub fn device_id(&self) -> Option<u8> {
        self.device_id
    }

    pub fn is_probing(&self) -> bool {
        self.deadline.is_some()
    }

    /// Start negotiating. Returns the backend immediately when no probe is
    /// needed (override present or SysEx not permitted), `None` while a
    /// probe is in flight.
    pub fn begin(
        &mut self,
        out: &mut dyn MidiSink,
        sysex_permitted: bool,
        forced: Option<BackendKind>,
        now: Instant,
    ) -> Option<BackendKind> {
        if let Some(kind) = forced {
            log::info!(target: "negotiation", "backend override: {}", kind);
            return Some(self.settle(kind));
        }
        if !sysex_permitted {
            log::info!(target: "negotiation", "SysEx not permitted, using channel rotation");
            return Some(self.settle(BackendKind::ChannelRotation));
        }

        let sent = out
            .send(&identity_request())
            .and_then(|_| out.send(&tuning_dump_request(self.tuning_program)));
        if let Err(e) = sent {
            log::info!(target: "negotiation", "probe could not be sent ({}), using channel rotation", e);
            return Some(self.settle(BackendKind::ChannelRotation));
        }

        log::debug!(target: "negotiation", "probing for MTS support ({} ms)", self.timeout.as_millis());
        self.mode = ProtocolMode::Detecting;
        self.deadline = Some(now + self.timeout);
        None
    }

    /// Feed an inbound exclusive message. Returns the new backend if it was
    /// a probe reply that settled negotiation.
    pub fn on_sysex(&mut self, data: &[u8]) -> Option<BackendKind> {
        if self.mode != ProtocolMode::Detecting || self.deadline.is_none() {
            return None;
        }
        let reply = parse_probe_reply(data)?;
        self.device_id = Some(reply.device_id());
        log::info!(
            target: "negotiation",
            "device {:#04x} answered ({:?}), using fine SysEx",
            reply.device_id(),
            reply
        );
        Some(self.settle(BackendKind::FineSysEx))
    }

    /// Check the probe deadline. Returns the fallback backend on timeout.
    pub fn poll(&mut self, now: Instant) -> Option<BackendKind> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        log::info!(target: "negotiation", "no probe reply, falling back to channel rotation");
        Some(self.settle(BackendKind::ChannelRotation))
    }

    /// Settle on `kind` without probing.
    pub fn force(&mut self, kind: BackendKind) -> BackendKind {
        self.settle(kind)
    }

    fn settle(&mut self, kind: BackendKind) -> BackendKind {
        self.deadline = None;
        self.mode = kind.into();
        kind
    }
}
