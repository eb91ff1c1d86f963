use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;

use intonal_types::{Sensitivity, Tonality};

use crate::predictive::ScoreOutbound;
use crate::protocol::BackendKind;

use super::thread::EngineThread;
use super::{EngineCmd, EngineEvent, EngineFeedback, Orchestrator};

/// Owns the engine thread. Dropping the handle shuts the engine down, which
/// stops it first.
pub struct EngineHandle {
    event_tx: Sender<EngineEvent>,
    cmd_tx: Sender<EngineCmd>,
    feedback_rx: Receiver<EngineFeedback>,
    join_handle: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn spawn(orchestrator: Orchestrator) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (feedback_tx, feedback_rx) = mpsc::channel();

        let join_handle = thread::Builder::new()
            .name("intonal-engine".into())
            .spawn(move || {
                EngineThread::new(orchestrator, event_rx, cmd_rx, feedback_tx).run();
            })
            .map_err(|e| log::error!("could not spawn engine thread: {}", e))
            .ok();

        Self {
            event_tx,
            cmd_tx,
            feedback_rx,
            join_handle,
        }
    }

    /// Sender for MIDI input and the score link.
    pub fn events(&self) -> Sender<EngineEvent> {
        self.event_tx.clone()
    }

    pub fn send_event(&self, event: EngineEvent) -> Result<(), String> {
        self.event_tx
            .send(event)
            .map_err(|_| "engine thread disconnected".to_string())
    }

    pub fn send_cmd(&self, cmd: EngineCmd) -> Result<(), String> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| "engine thread disconnected".to_string())
    }

    fn send(&self, cmd: EngineCmd) {
        if let Err(e) = self.send_cmd(cmd) {
            log::warn!("command dropped: {}", e);
        }
    }

    pub fn start(&self) {
        self.send(EngineCmd::Start);
    }

    /// Blocks until every note is off and the backend is reset.
    pub fn stop(&self) -> Result<(), String> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send_cmd(EngineCmd::Stop { reply: reply_tx })?;
        reply_rx
            .recv()
            .map_err(|_| "engine thread disconnected".to_string())
    }

    pub fn panic(&self) {
        self.send(EngineCmd::Panic);
    }

    pub fn set_sensitivity(&self, sensitivity: Sensitivity) {
        self.send(EngineCmd::SetSensitivity(sensitivity));
    }

    pub fn set_key_override(&self, key: Option<Tonality>) {
        self.send(EngineCmd::SetKeyOverride(key));
    }

    pub fn set_backend_override(&self, kind: Option<BackendKind>) {
        self.send(EngineCmd::SetBackendOverride(kind));
    }

    pub fn set_score_tap(&self, tap: Option<Sender<ScoreOutbound>>) {
        self.send(EngineCmd::SetScoreTap(tap));
    }

    pub fn drain_feedback(&self) -> Vec<EngineFeedback> {
        self.feedback_rx.try_iter().collect()
    }

    /// Wait up to `timeout` for the next feedback message.
    pub fn recv_feedback_timeout(&self, timeout: std::time::Duration) -> Option<EngineFeedback> {
        self.feedback_rx.recv_timeout(timeout).ok()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(EngineCmd::Shutdown);
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.join();
        }
    }
}
