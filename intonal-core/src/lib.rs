//! # intonal-core
//!
//! Realtime just-intonation retuning. Reads a MIDI performance, works out
//! the key, and sends each note out corrected to its five-limit ratio over
//! whichever tuning protocol the output device understands.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use intonal_core::config::Config;
//! use intonal_core::engine::{EngineHandle, Orchestrator};
//! use intonal_core::midi::MidirSink;
//!
//! let config = Config::load();
//! let sink = MidirSink::connect(0)?;
//! let orchestrator = Orchestrator::new(config.engine_settings(), Box::new(sink));
//! let engine = EngineHandle::spawn(orchestrator);
//!
//! // Forward input events into engine.events(), then:
//! engine.start();
//! for feedback in engine.drain_feedback() {
//!     println!("{:?}", feedback);
//! }
//! engine.stop()?;
//! ```
//!
//! ## Module Overview
//!
//! - [`engine`]: the orchestrator, its thread and the handle that drives it
//! - [`protocol`]: the three tuning backends and protocol negotiation
//! - [`key_detect`]: windowed key detection with hysteresis
//! - [`predictive`]: score-following predictions and their queue
//! - [`score_link`]: framed JSON link to the score-following service
//! - [`midi`]: input ports and output sinks
//! - [`export`]: offline tuning of a whole score
//! - [`config`]: layered TOML configuration

pub mod config;
pub mod engine;
pub mod export;
pub mod key_detect;
pub mod midi;
pub mod predictive;
pub mod protocol;
pub mod score_link;

pub use intonal_types;

pub use engine::{EngineFeedback, EngineHandle, NoteOutcome, Orchestrator};
pub use export::{tune_offline, OfflineTuning, ScoreMeta, ScoreNote};
pub use protocol::BackendKind;
