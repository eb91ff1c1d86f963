//! Offline batch tuning of a decoded score.
//!
//! Drives the same backends as the realtime engine, but into a
//! [`CaptureSink`] and without smoothing: every note gets the exact
//! deviation of the key in force at its onset.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use intonal_types::tuning::{deviation, tuned_freq};
use intonal_types::{KeySignature, PitchClass, Sensitivity, Tonality};

use crate::key_detect::estimate_notes;
use crate::midi::{CaptureSink, Sent};
use crate::protocol::{ApplyError, BackendKind, BackendSettings, NoteRef, TuningBackend};

/// A note from the file codec.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreNote {
    pub pitch: u8,
    pub start_secs: f64,
    pub end_secs: f64,
    pub velocity: u8,
    pub track: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreMeta {
    pub tempo_bpm: Option<f64>,
    pub time_signature: Option<(u8, u8)>,
    /// Key signatures with the time (seconds) they take effect.
    pub key_signatures: Vec<(f64, KeySignature)>,
    pub reference_a4: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Signature,
    Estimated,
    Default,
}

/// One output message with its time and, for note messages, its track.
#[derive(Debug, Clone, PartialEq)]
pub struct TunedEvent {
    pub time_secs: f64,
    pub track: Option<u16>,
    pub message: Sent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TunedNote {
    pub note: ScoreNote,
    pub cents: f64,
    pub freq_hz: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OfflineTuning {
    pub format: BackendKind,
    pub initial_key: Tonality,
    pub key_origin: KeyOrigin,
    /// Time-ordered.
    pub events: Vec<TunedEvent>,
    pub notes: Vec<TunedNote>,
    /// Notes that got no channel (channel rotation only).
    pub dropped: usize,
}

#[derive(Clone, Copy)]
enum Step {
    Off(usize),
    On(usize),
}

/// Fixed key source for a whole file.
struct KeyMap {
    changes: Vec<(f64, Tonality)>,
    fallback: Tonality,
    origin: KeyOrigin,
}

impl KeyMap {
    fn build(notes: &[ScoreNote], meta: &ScoreMeta) -> Self {
        let mut changes: Vec<(f64, Tonality)> = meta
            .key_signatures
            .iter()
            .filter_map(|(t, sig)| sig.tonality().map(|k| (*t, k)))
            .collect();
        changes.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        if let Some(&(_, first)) = changes.first() {
            return Self {
                changes,
                fallback: first,
                origin: KeyOrigin::Signature,
            };
        }

        let observations = notes.iter().map(|n| {
            let secs = (n.end_secs - n.start_secs).max(0.0);
            (n.pitch, Duration::from_secs_f64(secs), n.velocity)
        });
        match estimate_notes(observations, Sensitivity::Medium) {
            Some(estimate) => Self {
                changes,
                fallback: estimate.tonality,
                origin: KeyOrigin::Estimated,
            },
            None => Self {
                changes,
                fallback: Tonality::C_MAJOR,
                origin: KeyOrigin::Default,
            },
        }
    }

    /// The key in force at `time`; before the first signature, the first one.
    fn at(&self, time: f64) -> Tonality {
        self.changes
            .iter()
            .take_while(|(t, _)| *t <= time)
            .last()
            .map_or(self.fallback, |(_, k)| *k)
    }
}

fn valid(note: &ScoreNote) -> bool {
    note.pitch <= 127
        && note.start_secs.is_finite()
        && note.end_secs.is_finite()
        && note.start_secs >= 0.0
        && note.end_secs >= note.start_secs
}

/// Tune a whole score for `format`.
pub fn tune_offline(notes: &[ScoreNote], meta: &ScoreMeta, format: BackendKind) -> OfflineTuning {
    let notes: Vec<ScoreNote> = notes
        .iter()
        .filter(|n| {
            let ok = valid(n);
            if !ok {
                log::warn!("skipping malformed note {:?}", n);
            }
            ok
        })
        .copied()
        .collect();
    let keys = KeyMap::build(&notes, meta);
    let reference_a4 = meta.reference_a4.unwrap_or(440.0);

    let mut steps: Vec<(f64, Step)> = Vec::with_capacity(notes.len() * 2);
    for (i, n) in notes.iter().enumerate() {
        steps.push((n.start_secs, Step::On(i)));
        steps.push((n.end_secs, Step::Off(i)));
    }
    // Offs before ons at the same instant, so repeated notes free their channel.
    steps.sort_by(|a, b| {
        a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then_with(|| match (a.1, b.1) {
            (Step::Off(_), Step::On(_)) => Ordering::Less,
            (Step::On(_), Step::Off(_)) => Ordering::Greater,
            _ => Ordering::Equal,
        })
    });

    let sink = CaptureSink::with_ump();
    let mut out = sink.clone();
    let mut backend = TuningBackend::new(format, &BackendSettings::default());
    let mut events = Vec::new();
    let collect = |time_secs: f64, track: Option<u16>, events: &mut Vec<TunedEvent>| {
        events.extend(sink.take().into_iter().map(|message| TunedEvent {
            time_secs,
            track,
            message,
        }));
    };

    let mut key = keys.at(0.0);
    let initial_key = key;
    let prepared = backend
        .activate(&mut out)
        .and(backend.apply_key_change(&mut out, key));
    if let Err(e) = prepared {
        log::warn!("{} export setup incomplete: {}", format, e);
    }
    collect(0.0, None, &mut events);

    let base = Instant::now();
    let mut tuned = Vec::with_capacity(notes.len());
    let mut sounding = vec![false; notes.len()];
    let mut dropped = 0;

    for (time, step) in steps {
        match step {
            Step::On(i) => {
                let n = notes[i];
                let at_key = keys.at(time);
                if at_key != key {
                    key = at_key;
                    if let Err(e) = backend.apply_key_change(&mut out, key) {
                        log::warn!("key change to {} not exported: {}", key, e);
                    }
                    collect(time, None, &mut events);
                }

                let note_ref = note_ref(i, &n, base);
                let target = deviation(PitchClass::of_note(n.pitch), key.root, key.mode);
                let cents = match backend.apply_note(&mut out, &note_ref, target) {
                    Ok(applied) => applied.cents,
                    Err(ApplyError::ResourceExhausted) => {
                        dropped += 1;
                        collect(time, Some(n.track), &mut events);
                        continue;
                    }
                    Err(e) => {
                        log::debug!("note {} exported untuned: {}", n.pitch, e);
                        0.0
                    }
                };
                if let Err(e) = backend.note_on(&mut out, &note_ref) {
                    log::warn!("note {} not exported: {}", n.pitch, e);
                }
                collect(time, Some(n.track), &mut events);
                sounding[i] = true;
                tuned.push(TunedNote {
                    note: n,
                    cents,
                    freq_hz: tuned_freq(n.pitch, cents, reference_a4),
                });
            }
            Step::Off(i) => {
                if !sounding[i] {
                    continue;
                }
                let n = notes[i];
                let note_ref = note_ref(i, &n, base);
                let result = backend
                    .note_off(&mut out, &note_ref)
                    .and(backend.release_note(&mut out, &note_ref, note_ref.started_at + held(&n)));
                if let Err(e) = result {
                    log::warn!("note-off {} not exported: {}", n.pitch, e);
                }
                collect(time, Some(n.track), &mut events);
            }
        }
    }

    OfflineTuning {
        format,
        initial_key,
        key_origin: keys.origin,
        events,
        notes: tuned,
        dropped,
    }
}

fn held(note: &ScoreNote) -> Duration {
    Duration::from_secs_f64(note.end_secs - note.start_secs)
}

fn note_ref(index: usize, note: &ScoreNote, base: Instant) -> NoteRef {
    NoteRef {
        id: index as u64 + 1,
        pitch: note.pitch,
        velocity: note.velocity,
        started_at: base + Duration::from_secs_f64(note.start_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intonal_types::Mode;

    fn note(pitch: u8, start: f64, end: f64) -> ScoreNote {
        ScoreNote {
            pitch,
            start_secs: start,
            end_secs: end,
            velocity: 90,
            track: 0,
        }
    }

    fn c_major_phrase() -> Vec<ScoreNote> {
        [60u8, 62, 64, 65, 67, 69, 71, 72, 67, 64, 60]
            .iter()
            .enumerate()
            .map(|(i, &p)| note(p, i as f64 * 0.5, i as f64 * 0.5 + 0.4))
            .collect()
    }

    #[test]
    fn signature_sets_the_key() {
        let meta = ScoreMeta {
            key_signatures: vec![(0.0, KeySignature::new(1, false))],
            ..ScoreMeta::default()
        };
        let result = tune_offline(&[note(71, 0.0, 1.0)], &meta, BackendKind::FineSysEx);
        assert_eq!(result.initial_key, Tonality::new(PitchClass::G, Mode::Major));
        assert_eq!(result.key_origin, KeyOrigin::Signature);
        // B is the major third of G
        assert!((result.notes[0].cents + 13.686).abs() < 0.01);
    }

    #[test]
    fn estimates_key_without_signature() {
        let result = tune_offline(&c_major_phrase(), &ScoreMeta::default(), BackendKind::FineSysEx);
        assert_eq!(result.key_origin, KeyOrigin::Estimated);
        assert_eq!(result.initial_key, Tonality::C_MAJOR);
    }

    #[test]
    fn defaults_to_c_major() {
        let result = tune_offline(&[], &ScoreMeta::default(), BackendKind::FineSysEx);
        assert_eq!(result.key_origin, KeyOrigin::Default);
        assert_eq!(result.initial_key, Tonality::C_MAJOR);
    }

    #[test]
    fn high_res_export_emits_ump_only() {
        let meta = ScoreMeta {
            key_signatures: vec![(0.0, KeySignature::new(0, false))],
            ..ScoreMeta::default()
        };
        let result = tune_offline(&c_major_phrase(), &meta, BackendKind::HighResFormat);
        assert!(!result.events.is_empty());
        assert!(result.events.iter().all(|e| matches!(e.message, Sent::Ump(_))));
        assert_eq!(result.notes.len(), 11);
        assert!(result
            .events
            .windows(2)
            .all(|w| w[0].time_secs <= w[1].time_secs));
    }

    #[test]
    fn key_change_mid_file() {
        let meta = ScoreMeta {
            key_signatures: vec![
                (0.0, KeySignature::new(0, false)),
                (2.0, KeySignature::new(2, false)),
            ],
            ..ScoreMeta::default()
        };
        // F# is the tritone of C and the major third of D
        let notes = [note(66, 0.0, 0.5), note(66, 2.5, 3.0)];
        let result = tune_offline(&notes, &meta, BackendKind::FineSysEx);
        let scale_updates = result
            .events
            .iter()
            .filter(|e| matches!(e.message.bytes(), Some([0xF0, 0x7F, _, 0x08, 0x09, ..])))
            .count();
        assert_eq!(scale_updates, 2);
        assert!((result.notes[1].cents + 13.686).abs() < 0.01);
    }

    #[test]
    fn malformed_notes_skipped() {
        let notes = [note(60, 1.0, 0.5), note(200, 0.0, 1.0), note(64, 0.0, 1.0)];
        let result = tune_offline(&notes, &ScoreMeta::default(), BackendKind::ChannelRotation);
        assert_eq!(result.notes.len(), 1);
        assert_eq!(result.dropped, 0);
    }
}
