//! Messages exchanged with the score-following service.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use intonal_types::tuning::ratio_deviation;
use intonal_types::{KeySignature, Mode, Tonality};

/// Inbound message, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoreMessage {
    /// Upcoming notes keyed by MIDI pitch. Entries are validated one by one so
    /// a single bad entry doesn't cost the whole batch.
    Predictions {
        ji_ratios: BTreeMap<String, Vec<serde_json::Value>>,
        #[serde(default)]
        current_key: Option<String>,
        #[serde(default)]
        current_key_is_minor: Option<bool>,
        /// Key changes ahead in the score, nearest first.
        #[serde(default)]
        upcoming_key_changes: Vec<UpcomingKeyChange>,
    },
    /// Authoritative key from the score. All fields absent withdraws it.
    KeyOverride {
        #[serde(default)]
        key: Option<String>,
        #[serde(default)]
        is_minor: Option<bool>,
        #[serde(default)]
        fifths: Option<i8>,
    },
    Reset,
}

/// Outbound message: performed notes so the service can follow along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoreOutbound {
    MidiNote {
        pitch: u8,
        velocity: u8,
        timestamp: f64,
    },
}

/// A key change the score follower sees coming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpcomingKeyChange {
    pub key: String,
    #[serde(default)]
    pub is_minor: Option<bool>,
    /// Performed notes left before the new key starts; 0 means the next note.
    pub notes_until_change: u32,
}

impl UpcomingKeyChange {
    pub fn tonality(&self) -> Option<Tonality> {
        resolve_key(Some(&self.key), self.is_minor, None)
    }
}

/// Note identifier chosen by the score follower, numeric or textual
/// (`"<session>_<index>"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoteId {
    Num(u64),
    Text(String),
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoteId::Num(n) => write!(f, "{}", n),
            NoteId::Text(s) => f.write_str(s),
        }
    }
}

/// One prediction as it arrives; every field optional until validated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPrediction {
    #[serde(default)]
    pub note_id: Option<NoteId>,
    #[serde(default)]
    pub cents: Option<f64>,
    #[serde(default)]
    pub ratio: Option<f64>,
    #[serde(default)]
    pub scale_degree: Option<u8>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub is_minor: Option<bool>,
}

/// A validated prediction for one upcoming note.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictiveEntry {
    pub note_id: Option<NoteId>,
    pub pitch: u8,
    pub cents: f64,
    /// Wall-clock seconds (Unix epoch) when the prediction was made.
    pub timestamp_secs: f64,
    pub source: String,
    /// The score's key at this note, when the entry names one.
    pub key: Option<Tonality>,
}

/// Largest deviation accepted from a prediction.
const MAX_PREDICTED_CENTS: f64 = 100.0;

impl RawPrediction {
    /// Check required fields. Cents may come directly or from a ratio plus
    /// scale degree.
    pub fn validate(self, pitch: &str) -> Result<PredictiveEntry, String> {
        let pitch: u8 = pitch
            .trim()
            .parse()
            .ok()
            .filter(|p| *p <= 127)
            .ok_or_else(|| format!("bad pitch {:?}", pitch))?;

        let timestamp_secs = self
            .timestamp
            .filter(|t| t.is_finite() && *t >= 0.0)
            .ok_or("missing or invalid timestamp")?;

        let cents = match (self.cents, self.ratio, self.scale_degree) {
            (Some(c), _, _) if c.is_finite() => c,
            (_, Some(ratio), Some(degree)) => {
                ratio_deviation(ratio, degree).ok_or("invalid ratio or scale degree")?
            }
            _ => return Err("needs cents or ratio with scale_degree".into()),
        };
        if cents.abs() > MAX_PREDICTED_CENTS {
            return Err(format!("{:+.2} cents is not a plausible deviation", cents));
        }

        let key = self
            .key
            .as_deref()
            .and_then(|name| resolve_key(Some(name), self.is_minor, None));

        Ok(PredictiveEntry {
            note_id: self.note_id,
            pitch,
            cents,
            timestamp_secs,
            source: self.source.unwrap_or_else(|| "unknown".to_string()),
            key,
        })
    }
}

/// Decode every valid entry of a predictions batch; invalid ones are logged
/// and skipped.
pub fn decode_predictions(ji_ratios: &BTreeMap<String, Vec<serde_json::Value>>) -> Vec<PredictiveEntry> {
    let mut entries = Vec::new();
    for (pitch, batch) in ji_ratios {
        for value in batch {
            let parsed = serde_json::from_value::<RawPrediction>(value.clone())
                .map_err(|e| e.to_string())
                .and_then(|raw| raw.validate(pitch));
            match parsed {
                Ok(entry) => entries.push(entry),
                Err(reason) => {
                    log::debug!(target: "predictive", "ignoring prediction for {}: {}", pitch, reason)
                }
            }
        }
    }
    entries
}

/// Resolve the service's key spelling. `is_minor` wins over a mode suffix in
/// the name; a key signature is used when no name is given.
pub fn resolve_key(key: Option<&str>, is_minor: Option<bool>, fifths: Option<i8>) -> Option<Tonality> {
    let tonality = match key {
        Some(name) => Tonality::parse(name)?,
        None => return KeySignature::new(fifths?, is_minor.unwrap_or(false)).tonality(),
    };
    Some(match is_minor {
        Some(true) => Tonality::new(tonality.root, Mode::Minor),
        Some(false) => Tonality::new(tonality.root, Mode::Major),
        None => tonality,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use intonal_types::PitchClass;

    #[test]
    fn parses_predictions_message() {
        let json = r#"{
            "type": "predictions",
            "ji_ratios": {
                "61": [{"note_id": 12, "ratio": 1.0666666667, "cents": 11.73, "scale_degree": 1,
                        "tonic_pc": 0, "key": "C", "is_minor": false,
                        "source": "musicxml_key_signature", "timestamp": 1700000000.5}]
            },
            "current_key": "C",
            "current_key_is_minor": false
        }"#;
        let msg: ScoreMessage = serde_json::from_str(json).unwrap();
        let ScoreMessage::Predictions { ji_ratios, current_key, .. } = msg else {
            panic!("expected predictions");
        };
        assert_eq!(current_key.as_deref(), Some("C"));
        let entries = decode_predictions(&ji_ratios);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].pitch, 61);
        assert_eq!(entries[0].note_id, Some(NoteId::Num(12)));
        assert!((entries[0].cents - 11.73).abs() < 1e-9);
        assert_eq!(entries[0].source, "musicxml_key_signature");
        assert_eq!(entries[0].key, Some(Tonality::C_MAJOR));
    }

    #[test]
    fn score_follower_payload_decodes() {
        let json = r#"{
            "type": "predictions",
            "ji_ratios": {
                "61": [{"note_id": "pending_12", "ratio": 1.0666666667, "cents": 11.73,
                        "scale_degree": 1, "tonic_pc": 0, "key": "C", "is_minor": false,
                        "source": "musicxml_key_signature", "timestamp": 1700000000.5}],
                "69": [{"note_id": "a1b2c3_4", "ratio": 1.0, "cents": 0.0,
                        "scale_degree": 0, "tonic_pc": 9, "key": "Am", "is_minor": true,
                        "source": "musicxml_key_signature", "timestamp": 1700000000.5}]
            },
            "current_key": "C",
            "current_key_is_minor": false,
            "upcoming_key_changes": [
                {"position": 40, "onset_beat": 64.0, "key": "G", "tonic": 7,
                 "is_minor": false, "notes_until_change": 3}
            ]
        }"#;
        let msg: ScoreMessage = serde_json::from_str(json).unwrap();
        let ScoreMessage::Predictions {
            ji_ratios,
            upcoming_key_changes,
            ..
        } = msg
        else {
            panic!("expected predictions");
        };
        let entries = decode_predictions(&ji_ratios);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].note_id, Some(NoteId::Text("pending_12".into())));
        assert_eq!(entries[1].key, Some(Tonality::new(PitchClass::A, Mode::Minor)));
        assert_eq!(entries[1].note_id.as_ref().map(ToString::to_string).as_deref(), Some("a1b2c3_4"));

        assert_eq!(upcoming_key_changes.len(), 1);
        assert_eq!(upcoming_key_changes[0].notes_until_change, 3);
        assert_eq!(
            upcoming_key_changes[0].tonality(),
            Some(Tonality::new(PitchClass::G, Mode::Major))
        );
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let json = r#"{
            "type": "predictions",
            "ji_ratios": {
                "64": [
                    {"cents": -13.69},
                    {"cents": "flat", "timestamp": 5.0},
                    {"timestamp": 5.0},
                    {"cents": 900.0, "timestamp": 5.0},
                    {"ratio": 1.25, "scale_degree": 4, "timestamp": 5.0}
                ],
                "200": [{"cents": 0.0, "timestamp": 5.0}],
                "x": [{"cents": 0.0, "timestamp": 5.0}]
            }
        }"#;
        let msg: ScoreMessage = serde_json::from_str(json).unwrap();
        let ScoreMessage::Predictions { ji_ratios, .. } = msg else {
            panic!("expected predictions");
        };
        let entries = decode_predictions(&ji_ratios);
        assert_eq!(entries.len(), 1);
        assert!((entries[0].cents + 13.686).abs() < 0.001);
    }

    #[test]
    fn parses_key_override_and_reset() {
        let msg: ScoreMessage =
            serde_json::from_str(r#"{"type": "key_override", "key": "F#", "is_minor": true}"#).unwrap();
        assert_eq!(
            msg,
            ScoreMessage::KeyOverride {
                key: Some("F#".into()),
                is_minor: Some(true),
                fifths: None
            }
        );
        let reset: ScoreMessage = serde_json::from_str(r#"{"type": "reset"}"#).unwrap();
        assert_eq!(reset, ScoreMessage::Reset);
    }

    #[test]
    fn resolve_key_spellings() {
        assert_eq!(
            resolve_key(Some("Bb"), Some(false), None),
            Some(Tonality::new(PitchClass::As, Mode::Major))
        );
        assert_eq!(
            resolve_key(Some("A"), Some(true), None),
            Some(Tonality::new(PitchClass::A, Mode::Minor))
        );
        assert_eq!(
            resolve_key(Some("C#m"), None, None),
            Some(Tonality::new(PitchClass::Cs, Mode::Minor))
        );
        // Three flats, minor: C minor
        assert_eq!(
            resolve_key(None, Some(true), Some(-3)),
            Some(Tonality::new(PitchClass::C, Mode::Minor))
        );
        assert_eq!(resolve_key(None, None, None), None);
        assert_eq!(resolve_key(Some("H"), None, None), None);
    }

    #[test]
    fn outbound_note_encoding() {
        let json = serde_json::to_value(ScoreOutbound::MidiNote {
            pitch: 60,
            velocity: 90,
            timestamp: 12.5,
        })
        .unwrap();
        assert_eq!(json["type"], "midi_note");
        assert_eq!(json["pitch"], 60);
    }
}
