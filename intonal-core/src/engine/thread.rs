use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};

use super::telemetry::TickTelemetry;
use super::{EngineCmd, EngineEvent, EngineFeedback, Orchestrator};

/// How often tick statistics are reported.
const STATS_INTERVAL: Duration = Duration::from_secs(10);
/// Events handled per loop iteration before the tick gets a turn.
const MAX_EVENTS_PER_PASS: usize = 256;

pub(super) struct EngineThread {
    orchestrator: Orchestrator,
    event_rx: Receiver<EngineEvent>,
    cmd_rx: Receiver<EngineCmd>,
    feedback_tx: Sender<EngineFeedback>,
    tick_interval: Duration,
    last_tick: Instant,
    telemetry: TickTelemetry,
    last_stats: Instant,
    reported_overruns: u64,
}

impl EngineThread {
    pub(super) fn new(
        orchestrator: Orchestrator,
        event_rx: Receiver<EngineEvent>,
        cmd_rx: Receiver<EngineCmd>,
        feedback_tx: Sender<EngineFeedback>,
    ) -> Self {
        let tick_interval = orchestrator.settings().tick_interval;
        Self {
            orchestrator,
            event_rx,
            cmd_rx,
            feedback_tx,
            tick_interval,
            last_tick: Instant::now(),
            telemetry: TickTelemetry::new(),
            last_stats: Instant::now(),
            reported_overruns: 0,
        }
    }

    pub(super) fn run(mut self) {
        loop {
            let remaining = self.tick_interval.saturating_sub(self.last_tick.elapsed());

            crossbeam_channel::select! {
                recv(self.event_rx) -> event => match event {
                    Ok(event) => self.orchestrator.handle_event(event, Instant::now()),
                    Err(_) => break,
                },
                recv(self.cmd_rx) -> cmd => match cmd {
                    Ok(cmd) => {
                        if self.handle_cmd(cmd) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                default(remaining) => {}
            }

            if self.drain_events() {
                break;
            }

            let now = Instant::now();
            if now.duration_since(self.last_tick) >= self.tick_interval {
                self.last_tick = now;
                let started = Instant::now();
                self.orchestrator.tick(now);
                self.telemetry.record(started.elapsed(), self.tick_interval);
            }

            self.report_stats();
            self.flush_feedback();
        }

        if self.orchestrator.is_running() {
            self.orchestrator.stop();
        }
        self.flush_feedback();
        log::debug!("engine thread exiting");
    }

    /// Note events come before the tick. Returns true if the event side hung up.
    fn drain_events(&mut self) -> bool {
        for _ in 0..MAX_EVENTS_PER_PASS {
            match self.event_rx.try_recv() {
                Ok(event) => self.orchestrator.handle_event(event, Instant::now()),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
        false
    }

    /// Returns true on shutdown.
    fn handle_cmd(&mut self, cmd: EngineCmd) -> bool {
        let now = Instant::now();
        match cmd {
            EngineCmd::Start => self.orchestrator.start(now),
            EngineCmd::Stop { reply } => {
                self.orchestrator.stop();
                self.flush_feedback();
                let _ = reply.send(());
            }
            EngineCmd::Panic => self.orchestrator.panic(),
            EngineCmd::SetSensitivity(sensitivity) => self.orchestrator.set_sensitivity(sensitivity),
            EngineCmd::SetKeyOverride(key) => self.orchestrator.set_key_override(key),
            EngineCmd::SetBackendOverride(kind) => {
                self.orchestrator.set_backend_override(kind, now);
            }
            EngineCmd::SetScoreTap(tap) => self.orchestrator.set_score_tap(tap),
            EngineCmd::Shutdown => return true,
        }
        false
    }

    fn report_stats(&mut self) {
        if self.last_stats.elapsed() < STATS_INTERVAL {
            return;
        }
        self.last_stats = Instant::now();
        let summary = self.telemetry.take_summary();
        if summary.overruns > self.reported_overruns {
            log::warn!(
                "{} ticks overran {} ms (max {} us)",
                summary.overruns - self.reported_overruns,
                self.tick_interval.as_millis(),
                summary.max_us
            );
            self.reported_overruns = summary.overruns;
        }
        let _ = self.feedback_tx.send(EngineFeedback::TickStats {
            avg_us: summary.avg_us,
            max_us: summary.max_us,
            p95_us: summary.p95_us,
            overruns: summary.overruns,
        });
    }

    fn flush_feedback(&mut self) {
        for feedback in self.orchestrator.take_feedback() {
            if self.feedback_tx.send(feedback).is_err() {
                break;
            }
        }
    }
}
