use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use intonal_types::tuning::bend::BendRange;
use intonal_types::Sensitivity;

use crate::engine::{EngineSettings, OutputTarget};
use crate::key_detect::DetectorSettings;

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    detection: DetectionConfig,
    #[serde(default)]
    tuning: TuningConfig,
    #[serde(default)]
    output: OutputConfig,
    #[serde(default)]
    negotiation: NegotiationConfig,
    #[serde(default)]
    predictive: PredictiveConfig,
}

#[derive(Deserialize, Default)]
struct DetectionConfig {
    sensitivity: Option<String>,
    min_notes: Option<usize>,
    window_min_ms: Option<u64>,
    window_max_ms: Option<u64>,
    min_confidence: Option<f64>,
    confirmations: Option<u32>,
}

#[derive(Deserialize, Default)]
struct TuningConfig {
    reference_a4: Option<f64>,
    smoothing_min: Option<f64>,
    smoothing_max: Option<f64>,
    tick_hz: Option<u32>,
    repush_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct OutputConfig {
    target: Option<String>,
    bend_range_semitones: Option<f64>,
    base_channel: Option<u8>,
    steal_guard_ms: Option<u64>,
    sysex_permission: Option<bool>,
}

#[derive(Deserialize, Default)]
struct NegotiationConfig {
    probe_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct PredictiveConfig {
    stale_after_secs: Option<f64>,
}

/// Copy every field the user set over the embedded default.
macro_rules! overlay {
    ($base:expr, $user:expr; $($field:ident),+ $(,)?) => {
        $(
            if $user.$field.is_some() {
                $base.$field = $user.$field;
            }
        )+
    };
}

pub struct Config {
    detection: DetectionConfig,
    tuning: TuningConfig,
    output: OutputConfig,
    negotiation: NegotiationConfig,
    predictive: PredictiveConfig,
}

impl Config {
    /// Embedded defaults overlaid with `~/.config/intonal/config.toml` if present.
    pub fn load() -> Self {
        match user_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::from_file(embedded()),
        }
    }

    /// Embedded defaults overlaid with the file at `path`. A missing or
    /// malformed file leaves the defaults in place.
    pub fn load_from(path: &Path) -> Self {
        let mut base = embedded();

        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                    Ok(user) => merge(&mut base, user),
                    Err(e) => {
                        log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                    }
                },
                Err(e) => {
                    log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                }
            }
        }

        Self::from_file(base)
    }

    fn from_file(file: ConfigFile) -> Self {
        Config {
            detection: file.detection,
            tuning: file.tuning,
            output: file.output,
            negotiation: file.negotiation,
            predictive: file.predictive,
        }
    }

    pub fn sensitivity(&self) -> Sensitivity {
        self.detection
            .sensitivity
            .as_deref()
            .and_then(Sensitivity::parse)
            .unwrap_or_default()
    }

    pub fn detector(&self) -> DetectorSettings {
        let fallback = DetectorSettings::default();
        let window_min_ms = self
            .detection
            .window_min_ms
            .map(|ms| ms.clamp(500, 60_000) as f64)
            .unwrap_or(fallback.window_min_ms);
        let window_max_ms = self
            .detection
            .window_max_ms
            .map(|ms| ms.clamp(500, 120_000) as f64)
            .unwrap_or(fallback.window_max_ms)
            .max(window_min_ms);
        DetectorSettings {
            min_notes: self
                .detection
                .min_notes
                .map(|n| n.clamp(1, 256))
                .unwrap_or(fallback.min_notes),
            window_min_ms,
            window_max_ms,
            min_confidence: self
                .detection
                .min_confidence
                .map(|c| c.clamp(0.0, 100.0))
                .unwrap_or(fallback.min_confidence),
            confirmations: self
                .detection
                .confirmations
                .map(|c| c.clamp(1, 16))
                .unwrap_or(fallback.confirmations),
        }
    }

    pub fn output_target(&self) -> OutputTarget {
        self.output
            .target
            .as_deref()
            .and_then(parse_output_target)
            .unwrap_or_default()
    }

    pub fn bend_range(&self) -> BendRange {
        self.output
            .bend_range_semitones
            .map(BendRange::new)
            .unwrap_or(BendRange::MPE_DEFAULT)
    }

    /// Whether the host granted exclusive (SysEx) message access.
    pub fn sysex_permission(&self) -> bool {
        self.output.sysex_permission.unwrap_or(true)
    }

    /// Settings for the realtime engine, with every value clamped to a sane range.
    pub fn engine_settings(&self) -> EngineSettings {
        let fallback = EngineSettings::default();
        let smoothing_min = self
            .tuning
            .smoothing_min
            .map(|f| f.clamp(0.01, 1.0))
            .unwrap_or(fallback.smoothing_min);
        let smoothing_max = self
            .tuning
            .smoothing_max
            .map(|f| f.clamp(0.01, 1.0))
            .unwrap_or(fallback.smoothing_max)
            .max(smoothing_min);
        let tick_hz = self.tuning.tick_hz.map(|hz| hz.clamp(10, 120));

        EngineSettings {
            sensitivity: self.sensitivity(),
            detector: self.detector(),
            reference_a4: self
                .tuning
                .reference_a4
                .filter(|a4| (300.0..=600.0).contains(a4))
                .unwrap_or(fallback.reference_a4),
            smoothing_min,
            smoothing_max,
            tick_interval: tick_hz
                .map(|hz| Duration::from_micros(1_000_000 / hz as u64))
                .unwrap_or(fallback.tick_interval),
            repush_interval: self
                .tuning
                .repush_ms
                .map(|ms| Duration::from_millis(ms.clamp(20, 2_000)))
                .unwrap_or(fallback.repush_interval),
            output_target: self.output_target(),
            bend_range: self.bend_range(),
            base_channel: self
                .output
                .base_channel
                .map(|ch| ch.min(15))
                .unwrap_or(fallback.base_channel),
            steal_guard: self
                .output
                .steal_guard_ms
                .map(|ms| Duration::from_millis(ms.min(1_000)))
                .unwrap_or(fallback.steal_guard),
            probe_timeout: self
                .negotiation
                .probe_timeout_ms
                .map(|ms| Duration::from_millis(ms.clamp(50, 2_000)))
                .unwrap_or(fallback.probe_timeout),
            stale_after_secs: self
                .predictive
                .stale_after_secs
                .filter(|s| s.is_finite() && *s > 0.0)
                .unwrap_or(fallback.stale_after_secs),
        }
    }
}

fn embedded() -> ConfigFile {
    toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|e| {
        log::error!(target: "config", "embedded config.toml is invalid: {}", e);
        ConfigFile::default()
    })
}

/// Directory holding the user config, log file, and persisted preferences.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("intonal"))
}

fn user_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

fn merge(base: &mut ConfigFile, user: ConfigFile) {
    overlay!(base.detection, user.detection;
        sensitivity, min_notes, window_min_ms, window_max_ms, min_confidence, confirmations);
    overlay!(base.tuning, user.tuning;
        reference_a4, smoothing_min, smoothing_max, tick_hz, repush_ms);
    overlay!(base.output, user.output;
        target, bend_range_semitones, base_channel, steal_guard_ms, sysex_permission);
    overlay!(base.negotiation, user.negotiation; probe_timeout_ms);
    overlay!(base.predictive, user.predictive; stale_after_secs);
}

fn parse_output_target(s: &str) -> Option<OutputTarget> {
    match s.to_lowercase().as_str() {
        "external" | "midi" => Some(OutputTarget::External),
        "internal" | "synth" => Some(OutputTarget::Internal),
        _ => None,
    }
}
