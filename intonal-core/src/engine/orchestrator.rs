use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::Sender;

use intonal_types::tuning::smoothing::{smooth_toward, tempo_adaptive_factor};
use intonal_types::tuning::tuned_freq;
use intonal_types::{KeyEstimate, PitchClass, Sensitivity, Tonality, TuningTable};

use crate::key_detect::KeyDetector;
use crate::midi::{MidiEventKind, MidiSink, CC_SUSTAIN};
use crate::predictive::{decode_predictions, resolve_key, PredictiveQueue, ScoreMessage, ScoreOutbound};
use crate::protocol::negotiation::Negotiator;
use crate::protocol::{ApplyError, BackendKind, BackendSettings, NoteRef, ProtocolMode, TuningBackend};

use super::{
    Degradation, EngineEvent, EngineFeedback, EngineSettings, KeySource, NoteOutcome, OutputTarget,
    TuningSource, VoiceSink,
};

/// Re-push only when a note's deviation moved more than this.
const REPUSH_EPSILON_CENTS: f64 = 0.05;
/// Smoothed values this close to target snap onto it.
const SNAP_CENTS: f64 = 0.001;
/// Backend used until negotiation settles.
const INITIAL_BACKEND: BackendKind = BackendKind::ChannelRotation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteState {
    /// Key held.
    Sounding,
    /// Key released while the sustain pedal is down.
    Sustained,
    /// Lost its channel to a newer note.
    Cut,
    /// Never sounded: no resource was available.
    Dropped,
}

/// One note-on event, alive until its note-off (or its pedal release).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveNote {
    pub id: u64,
    pub pitch: u8,
    pub velocity: u8,
    pub started_at: Instant,
    /// Deviation last transmitted.
    pub cents: f64,
    pub source: TuningSource,
    /// False once the note fell back to equal temperament.
    pub tuned: bool,
    pub state: NoteState,
}

impl ActiveNote {
    fn note_ref(&self) -> NoteRef {
        NoteRef {
            id: self.id,
            pitch: self.pitch,
            velocity: self.velocity,
            started_at: self.started_at,
        }
    }

    fn follows_table(&self) -> bool {
        self.tuned
            && self.source == TuningSource::Reactive
            && matches!(self.state, NoteState::Sounding | NoteState::Sustained)
    }
}

/// Owns every piece of mutable tuning state. Single-threaded: callers feed
/// it events and ticks in order.
pub struct Orchestrator {
    settings: EngineSettings,
    out: Box<dyn MidiSink>,
    voices: Option<Box<dyn VoiceSink>>,
    backend: TuningBackend,
    backend_settings: BackendSettings,
    negotiator: Negotiator,
    sysex_permitted: bool,
    forced_backend: Option<BackendKind>,

    detector: KeyDetector,
    predictive: PredictiveQueue,
    manual_key: Option<Tonality>,
    score_key: Option<Tonality>,
    /// Next announced score key and the performed notes left before it.
    upcoming_key: Option<(Tonality, u32)>,
    detected: Option<KeyEstimate>,
    key: Option<(Tonality, KeySource)>,
    target: TuningTable,
    smoothed: TuningTable,

    notes: HashMap<u64, ActiveNote>,
    /// Note ids per pitch, most recent last.
    stacks: HashMap<u8, Vec<u64>>,
    next_id: u64,
    sustain: bool,
    running: bool,
    last_repush: Option<Instant>,

    epoch: Instant,
    epoch_secs: f64,
    score_tap: Option<Sender<ScoreOutbound>>,
    feedback: Vec<EngineFeedback>,
}

impl Orchestrator {
    pub fn new(settings: EngineSettings, out: Box<dyn MidiSink>) -> Self {
        let backend_settings = BackendSettings {
            base_channel: settings.base_channel,
            bend_range: settings.bend_range,
            steal_guard: settings.steal_guard,
            ..BackendSettings::default()
        };
        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Self {
            backend: TuningBackend::new(INITIAL_BACKEND, &backend_settings),
            negotiator: Negotiator::new(settings.probe_timeout, backend_settings.tuning_program),
            detector: KeyDetector::new(settings.detector.clone(), settings.sensitivity),
            predictive: PredictiveQueue::new(settings.stale_after_secs),
            backend_settings,
            out,
            voices: None,
            sysex_permitted: true,
            forced_backend: None,
            manual_key: None,
            score_key: None,
            upcoming_key: None,
            detected: None,
            key: None,
            target: TuningTable::EQUAL,
            smoothed: TuningTable::EQUAL,
            notes: HashMap::new(),
            stacks: HashMap::new(),
            next_id: 1,
            sustain: false,
            running: false,
            last_repush: None,
            epoch: Instant::now(),
            epoch_secs,
            score_tap: None,
            feedback: Vec::new(),
            settings,
        }
    }

    /// Route tuned notes to a built-in synth instead of MIDI out.
    pub fn with_voices(mut self, voices: Box<dyn VoiceSink>) -> Self {
        self.voices = Some(voices);
        self.settings.output_target = OutputTarget::Internal;
        self
    }

    pub fn set_sysex_permission(&mut self, permitted: bool) {
        self.sysex_permitted = permitted;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn current_key(&self) -> Option<Tonality> {
        self.key.map(|(k, _)| k)
    }

    pub fn key_source(&self) -> Option<KeySource> {
        self.key.map(|(_, s)| s)
    }

    pub fn protocol_mode(&self) -> ProtocolMode {
        self.negotiator.mode()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn forced_backend(&self) -> Option<BackendKind> {
        self.forced_backend
    }

    pub fn target_table(&self) -> &TuningTable {
        &self.target
    }

    pub fn smoothed_table(&self) -> &TuningTable {
        &self.smoothed
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.detector.sensitivity()
    }

    pub fn note(&self, id: u64) -> Option<&ActiveNote> {
        self.notes.get(&id)
    }

    /// Active notes, oldest first.
    pub fn active_notes(&self) -> Vec<ActiveNote> {
        let mut notes: Vec<ActiveNote> = self.notes.values().copied().collect();
        notes.sort_by_key(|n| n.id);
        notes
    }

    pub fn pending_predictions(&self, pitch: u8) -> usize {
        self.predictive.pending(pitch)
    }

    /// Wall-clock seconds (Unix epoch) at `now`, the timebase of predictions.
    pub fn wall_secs(&self, now: Instant) -> f64 {
        if now >= self.epoch {
            self.epoch_secs + now.duration_since(self.epoch).as_secs_f64()
        } else {
            self.epoch_secs - self.epoch.duration_since(now).as_secs_f64()
        }
    }

    pub fn take_feedback(&mut self) -> Vec<EngineFeedback> {
        std::mem::take(&mut self.feedback)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Activate the current backend and start negotiating. Notes are routed
    /// through the current backend while a probe is in flight.
    pub fn start(&mut self, now: Instant) {
        if self.running {
            return;
        }
        self.running = true;
        if self.settings.output_target == OutputTarget::Internal {
            log::info!("engine started (internal synth)");
            return;
        }

        if let Err(e) = self.backend.activate(self.out.as_mut()) {
            log::warn!("could not activate {} backend: {}", self.backend.kind(), e);
        }
        if let Some(key) = self.current_key() {
            self.send_key_change(key);
        }
        if let Some(kind) =
            self.negotiator
                .begin(self.out.as_mut(), self.sysex_permitted, self.forced_backend, now)
        {
            self.switch_backend(kind, now);
        }
        log::info!("engine started ({} backend)", self.backend.kind());
    }

    /// Every note off, backend back to equal temperament. Synchronous.
    pub fn stop(&mut self) {
        self.flush_notes();
        if self.settings.output_target == OutputTarget::External {
            if let Err(e) = self.backend.reset(self.out.as_mut()) {
                log::warn!("backend reset incomplete: {}", e);
            }
        }
        self.sustain = false;
        self.running = false;
        self.last_repush = None;
        self.feedback.push(EngineFeedback::Stopped);
        log::info!("engine stopped");
    }

    /// Immediate silence: flush, reset, and All Notes Off on every channel.
    /// The engine keeps running.
    pub fn panic(&mut self) {
        log::warn!("panic: all notes off");
        self.flush_notes();
        self.sustain = false;
        if self.settings.output_target == OutputTarget::External {
            let result = self
                .backend
                .reset(self.out.as_mut())
                .and(self.backend.all_notes_off(self.out.as_mut()));
            if let Err(e) = result {
                log::warn!("panic could not reach the output: {}", e);
            }
        }
    }

    /// Release times don't matter here: the backend is reset right after.
    fn flush_notes(&mut self) {
        let now = Instant::now();
        let mut ids: Vec<u64> = self.notes.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.finish_note(id, now);
        }
        self.notes.clear();
        self.stacks.clear();
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    pub fn set_sensitivity(&mut self, sensitivity: Sensitivity) {
        log::info!("key detection sensitivity: {}", sensitivity.name());
        self.detector.set_sensitivity(sensitivity);
    }

    /// Manual key; overrides the score and detection until cleared.
    pub fn set_key_override(&mut self, key: Option<Tonality>) {
        self.manual_key = key;
        self.refresh_key();
    }

    /// Force a realtime backend or, with `None`, go back to negotiating.
    /// The high-resolution format is export-only and is refused.
    pub fn set_backend_override(&mut self, kind: Option<BackendKind>, now: Instant) -> bool {
        if kind == Some(BackendKind::HighResFormat) {
            log::warn!("{} is only available for export", BackendKind::HighResFormat);
            return false;
        }
        self.forced_backend = kind;
        let live = self.running && self.settings.output_target == OutputTarget::External;
        match kind {
            Some(kind) => {
                self.negotiator.force(kind);
                if live {
                    self.switch_backend(kind, now);
                }
            }
            None => {
                if live {
                    if let Some(kind) =
                        self.negotiator
                            .begin(self.out.as_mut(), self.sysex_permitted, None, now)
                    {
                        self.switch_backend(kind, now);
                    }
                }
            }
        }
        true
    }

    pub fn set_score_tap(&mut self, tap: Option<Sender<ScoreOutbound>>) {
        self.score_tap = tap;
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn handle_event(&mut self, event: EngineEvent, now: Instant) {
        match event {
            EngineEvent::Midi(midi) => match midi.kind {
                MidiEventKind::NoteOn { note, velocity, .. } => {
                    self.note_on(note, velocity, now);
                }
                MidiEventKind::NoteOff { note, .. } => self.note_off(note, now),
                MidiEventKind::ControlChange {
                    controller, value, ..
                } => self.control_change(controller, value, now),
                MidiEventKind::SysEx(data) => self.on_sysex(&data, now),
                // The engine owns pitch bend on the output side.
                MidiEventKind::PitchBend { .. } => {}
            },
            EngineEvent::Score(msg) => self.apply_score_message(msg),
            EngineEvent::ScoreLinkClosed => self.score_link_closed(),
        }
    }

    pub fn note_on(&mut self, pitch: u8, velocity: u8, now: Instant) -> NoteOutcome {
        if !self.running {
            return NoteOutcome::Ignored;
        }
        let id = self.next_id;
        self.next_id += 1;

        self.detector.note_on(pitch, velocity, now);
        if let Some(estimate) = self.detector.detect(now) {
            self.detected = Some(estimate);
            self.refresh_key();
        }
        self.report_to_score(pitch, velocity, now);
        self.advance_upcoming_key();

        let consumed = self.predictive.consume(pitch, self.wall_secs(now));
        let (cents, source) = match consumed.entry {
            Some(entry) => {
                if entry.key.is_some() {
                    self.set_score_key(entry.key);
                }
                log::debug!(
                    target: "predictive",
                    "note {} uses predicted {:+.2} cents ({})",
                    pitch,
                    entry.cents,
                    entry.source
                );
                (entry.cents, TuningSource::Predictive)
            }
            None => (self.smoothed.for_note(pitch), TuningSource::Reactive),
        };

        let mut note = ActiveNote {
            id,
            pitch,
            velocity,
            started_at: now,
            cents,
            source,
            tuned: true,
            state: NoteState::Sounding,
        };
        let outcome = match self.settings.output_target {
            OutputTarget::Internal => {
                if let Some(voices) = self.voices.as_mut() {
                    voices.note_on(pitch, velocity, cents);
                }
                self.tuned_outcome(&note)
            }
            OutputTarget::External => self.sound_external(&mut note),
        };

        self.stacks.entry(pitch).or_default().push(id);
        self.notes.insert(id, note);
        outcome
    }

    /// Tune then sound one note on the active backend. Tuning failures other
    /// than exhaustion still sound the note, untuned.
    fn sound_external(&mut self, note: &mut ActiveNote) -> NoteOutcome {
        let note_ref = note.note_ref();
        let outcome = match self.backend.apply_note(self.out.as_mut(), &note_ref, note.cents) {
            Ok(applied) => {
                if let Some(victim) = applied.stolen {
                    self.cut_note(victim.note_id);
                }
                if applied.fallback {
                    self.feedback.push(EngineFeedback::Degraded {
                        pitch: note.pitch,
                        reason: Degradation::Fallback,
                    });
                }
                note.cents = applied.cents;
                self.tuned_outcome(note)
            }
            Err(ApplyError::ResourceExhausted) => {
                log::warn!("dropping note {}: every channel is held", note.pitch);
                note.tuned = false;
                note.state = NoteState::Dropped;
                let reason = Degradation::ResourceExhausted;
                self.feedback.push(EngineFeedback::NoteDropped {
                    pitch: note.pitch,
                    reason: reason.clone(),
                });
                return NoteOutcome::Dropped { id: note.id, reason };
            }
            Err(e) => {
                log::warn!("note {} plays in equal temperament: {}", note.pitch, e);
                let reason = match e {
                    ApplyError::OutOfRange { cents } => Degradation::OutOfRange { cents },
                    ApplyError::Transport(e) => Degradation::Transport(e.to_string()),
                    ApplyError::ResourceExhausted => Degradation::ResourceExhausted,
                };
                note.tuned = false;
                note.cents = 0.0;
                self.feedback.push(EngineFeedback::Degraded {
                    pitch: note.pitch,
                    reason: reason.clone(),
                });
                NoteOutcome::EqualTemperament { id: note.id, reason }
            }
        };

        if let Err(e) = self.backend.note_on(self.out.as_mut(), &note_ref) {
            log::warn!("note-on {} failed: {}", note.pitch, e);
            self.feedback.push(EngineFeedback::Degraded {
                pitch: note.pitch,
                reason: Degradation::Transport(e.to_string()),
            });
        }
        outcome
    }

    fn tuned_outcome(&self, note: &ActiveNote) -> NoteOutcome {
        NoteOutcome::Tuned {
            id: note.id,
            cents: note.cents,
            freq_hz: tuned_freq(note.pitch, note.cents, self.settings.reference_a4),
            source: note.source,
        }
    }

    fn cut_note(&mut self, id: u64) {
        if let Some(victim) = self.notes.get_mut(&id) {
            victim.state = NoteState::Cut;
            victim.tuned = false;
            self.feedback.push(EngineFeedback::NoteDropped {
                pitch: victim.pitch,
                reason: Degradation::Stolen,
            });
        }
    }

    pub fn note_off(&mut self, pitch: u8, now: Instant) {
        self.detector.note_off(pitch, now);

        let Some(stack) = self.stacks.get_mut(&pitch) else {
            return;
        };
        let popped = stack.pop();
        if stack.is_empty() {
            self.stacks.remove(&pitch);
        }
        let Some(id) = popped else {
            return;
        };
        let Some(state) = self.notes.get(&id).map(|n| n.state) else {
            return;
        };

        match state {
            NoteState::Cut | NoteState::Dropped => {
                self.notes.remove(&id);
            }
            NoteState::Sounding if self.sustain => self.hold_for_pedal(id),
            NoteState::Sounding | NoteState::Sustained => self.finish_note(id, now),
        }
    }

    /// Internal voices keep sounding until pedal-up. External synths handle
    /// the pedal themselves, so the note-off goes out now and only the
    /// tuning resource is held.
    fn hold_for_pedal(&mut self, id: u64) {
        let Some(note) = self.notes.get_mut(&id) else {
            return;
        };
        note.state = NoteState::Sustained;
        if self.settings.output_target == OutputTarget::External {
            let note_ref = note.note_ref();
            if let Err(e) = self.backend.note_off(self.out.as_mut(), &note_ref) {
                log::warn!("note-off {} failed: {}", note_ref.pitch, e);
            }
        }
    }

    /// Silence a note and free its tuning resource as of `now`.
    fn finish_note(&mut self, id: u64, now: Instant) {
        let Some(note) = self.notes.remove(&id) else {
            return;
        };
        if matches!(note.state, NoteState::Cut | NoteState::Dropped) {
            return;
        }
        match self.settings.output_target {
            OutputTarget::Internal => {
                if let Some(voices) = self.voices.as_mut() {
                    voices.note_off(note.pitch);
                }
            }
            OutputTarget::External => {
                let note_ref = note.note_ref();
                let off = if note.state == NoteState::Sounding {
                    self.backend.note_off(self.out.as_mut(), &note_ref)
                } else {
                    Ok(())
                };
                let result = off.and(self.backend.release_note(self.out.as_mut(), &note_ref, now));
                if let Err(e) = result {
                    log::warn!("releasing note {} failed: {}", note.pitch, e);
                }
            }
        }
    }

    pub fn control_change(&mut self, controller: u8, value: u8, now: Instant) {
        let external = self.running && self.settings.output_target == OutputTarget::External;
        if external {
            if let Err(e) = self.backend.control_change(self.out.as_mut(), controller, value) {
                log::warn!("control change {} failed: {}", controller, e);
            }
        }
        if controller != CC_SUSTAIN {
            return;
        }

        let down = value >= 64;
        if down == self.sustain {
            return;
        }
        self.sustain = down;
        if !down {
            let mut held: Vec<u64> = self
                .notes
                .values()
                .filter(|n| n.state == NoteState::Sustained)
                .map(|n| n.id)
                .collect();
            held.sort_unstable();
            for id in held {
                self.finish_note(id, now);
            }
        }
    }

    pub fn on_sysex(&mut self, data: &[u8], now: Instant) {
        if let Some(kind) = self.negotiator.on_sysex(data) {
            if let Some(device_id) = self.negotiator.device_id() {
                self.backend_settings.device_id = device_id;
            }
            self.switch_backend(kind, now);
        }
    }

    // ------------------------------------------------------------------
    // Score follower
    // ------------------------------------------------------------------

    pub fn apply_score_message(&mut self, msg: ScoreMessage) {
        match msg {
            ScoreMessage::Predictions {
                ji_ratios,
                current_key,
                current_key_is_minor,
                upcoming_key_changes,
            } => {
                let entries = decode_predictions(&ji_ratios);
                log::debug!(target: "predictive", "queued {} predictions", entries.len());
                self.predictive.extend(entries);
                if let Some(name) = current_key.as_deref() {
                    self.set_score_key(resolve_key(Some(name), current_key_is_minor, None));
                }
                // Each batch restates what lies ahead
                self.upcoming_key = upcoming_key_changes
                    .iter()
                    .find_map(|change| change.tonality().map(|k| (k, change.notes_until_change)));
                if let Some((key, notes)) = self.upcoming_key {
                    log::debug!(target: "predictive", "score moves to {} in {} notes", key, notes);
                }
            }
            ScoreMessage::KeyOverride { key, is_minor, fifths } => {
                if key.is_none() && fifths.is_none() {
                    self.set_score_key(None);
                } else {
                    match resolve_key(key.as_deref(), is_minor, fifths) {
                        Some(tonality) => self.set_score_key(Some(tonality)),
                        None => log::debug!(target: "predictive", "ignoring unreadable key {:?}", key),
                    }
                }
            }
            ScoreMessage::Reset => {
                log::info!(target: "predictive", "score follower reset");
                self.withdraw_score();
            }
        }
    }

    pub fn score_link_closed(&mut self) {
        self.score_tap = None;
        self.withdraw_score();
    }

    fn withdraw_score(&mut self) {
        self.predictive.clear();
        self.upcoming_key = None;
        self.set_score_key(None);
    }

    /// Count one performed note toward an announced key change, switching
    /// the score key when it is due.
    fn advance_upcoming_key(&mut self) {
        match self.upcoming_key {
            Some((key, 0)) => {
                self.upcoming_key = None;
                self.set_score_key(Some(key));
            }
            Some((key, n)) => self.upcoming_key = Some((key, n - 1)),
            None => {}
        }
    }

    fn set_score_key(&mut self, key: Option<Tonality>) {
        if self.score_key != key {
            self.score_key = key;
            self.refresh_key();
        }
    }

    fn report_to_score(&mut self, pitch: u8, velocity: u8, now: Instant) {
        let Some(tap) = self.score_tap.as_ref() else {
            return;
        };
        let msg = ScoreOutbound::MidiNote {
            pitch,
            velocity,
            timestamp: self.wall_secs(now),
        };
        if tap.send(msg).is_err() {
            self.score_tap = None;
        }
    }

    // ------------------------------------------------------------------
    // Key and tables
    // ------------------------------------------------------------------

    /// Manual beats score beats detection.
    fn refresh_key(&mut self) {
        let next = self
            .manual_key
            .map(|k| (k, KeySource::Manual))
            .or(self.score_key.map(|k| (k, KeySource::Score)))
            .or(self.detected.map(|e| (e.tonality, KeySource::Detected)));
        let changed = next.map(|(k, _)| k) != self.current_key();
        self.key = next;
        if !changed {
            return;
        }

        self.target = next.map_or(TuningTable::EQUAL, |(k, _)| TuningTable::for_key(k));
        let confidence = match next {
            Some((_, KeySource::Detected)) => self.detected.map(|e| e.confidence),
            _ => None,
        };
        match next {
            Some((key, source)) => {
                log::info!("key: {} ({})", key, source);
                if self.running {
                    self.send_key_change(key);
                }
            }
            None => log::info!("key withdrawn, drifting to equal temperament"),
        }
        self.feedback.push(EngineFeedback::KeyChanged {
            key: next.map(|(k, _)| k),
            source: next.map(|(_, s)| s),
            confidence,
        });
    }

    fn send_key_change(&mut self, key: Tonality) {
        if self.settings.output_target != OutputTarget::External {
            return;
        }
        if let Err(e) = self.backend.apply_key_change(self.out.as_mut(), key) {
            log::warn!("key change could not be sent: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Fixed-rate housekeeping: settle negotiation, glide the table toward
    /// its target, and (throttled) re-push notes that drifted.
    pub fn tick(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        if let Some(kind) = self.negotiator.poll(now) {
            self.switch_backend(kind, now);
        }

        let factor = tempo_adaptive_factor(
            self.detector.ioi_ms(),
            self.settings.smoothing_min,
            self.settings.smoothing_max,
        );
        for pc in PitchClass::ALL {
            let target = self.target.cents(pc);
            let mut next = smooth_toward(self.smoothed.cents(pc), target, factor);
            if (next - target).abs() < SNAP_CENTS {
                next = target;
            }
            self.smoothed.set(pc, next);
        }

        let due = self
            .last_repush
            .map_or(true, |at| now.saturating_duration_since(at) >= self.settings.repush_interval);
        if due {
            self.last_repush = Some(now);
            self.repush();
        }
    }

    fn repush(&mut self) {
        let mut ids: Vec<u64> = self
            .notes
            .values()
            .filter(|n| n.follows_table())
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();

        for id in ids {
            let Some(note) = self.notes.get(&id).copied() else {
                continue;
            };
            let cents = self.smoothed.for_note(note.pitch);
            if (cents - note.cents).abs() <= REPUSH_EPSILON_CENTS {
                continue;
            }
            let sent = match self.settings.output_target {
                OutputTarget::Internal => {
                    if let Some(voices) = self.voices.as_mut() {
                        voices.retune(note.pitch, cents);
                    }
                    Some(cents)
                }
                OutputTarget::External => {
                    match self.backend.apply_note(self.out.as_mut(), &note.note_ref(), cents) {
                        Ok(applied) => Some(applied.cents),
                        Err(e) => {
                            log::debug!("re-push of note {} failed: {}", note.pitch, e);
                            None
                        }
                    }
                }
            };
            if let (Some(cents), Some(n)) = (sent, self.notes.get_mut(&id)) {
                n.cents = cents;
            }
        }
    }

    // ------------------------------------------------------------------
    // Backend switching
    // ------------------------------------------------------------------

    /// Move to `kind`, re-homing every held note: its old representation is
    /// released and reset, then it is retuned and re-sounded on the new one.
    fn switch_backend(&mut self, kind: BackendKind, now: Instant) {
        if self.backend.kind() == kind {
            self.backend.set_device_id(self.backend_settings.device_id);
            return;
        }
        log::info!(target: "negotiation", "switching backend {} -> {}", self.backend.kind(), kind);

        let mut held: Vec<ActiveNote> = self
            .notes
            .values()
            .filter(|n| n.state == NoteState::Sounding)
            .copied()
            .collect();
        held.sort_by_key(|n| n.id);

        let out = self.out.as_mut();
        let mut result = Ok(());
        for note in &held {
            let note_ref = note.note_ref();
            result = result
                .and(self.backend.note_off(out, &note_ref))
                .and(self.backend.release_note(out, &note_ref, now));
        }
        result = result.and(self.backend.reset(out));

        let mut next = TuningBackend::new(kind, &self.backend_settings);
        result = result.and(next.activate(out));
        if let Err(e) = result {
            log::warn!("backend switch was not clean: {}", e);
        }
        self.backend = next;
        if let Some(key) = self.current_key() {
            self.send_key_change(key);
        }
        self.feedback.push(EngineFeedback::ModeChanged(kind));

        for note in held {
            let mut rehomed = note;
            rehomed.tuned = true;
            let outcome = self.sound_external(&mut rehomed);
            if let NoteOutcome::EqualTemperament { .. } = outcome {
                rehomed.tuned = false;
            }
            self.notes.insert(rehomed.id, rehomed);
        }
    }
}
