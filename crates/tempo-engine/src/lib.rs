//! Tempo-controlled playback engine.
//!
//! A source is transcoded into a scratch file, scheduled on a player node and rendered
//! through variable-speed and time-pitch stages into an output mixer.

pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
pub mod error;
pub mod export;
pub mod graph;
pub mod mixer;
pub mod output;
pub mod pitch;
pub mod playback;
pub mod queue;
pub mod render;
pub mod scratch;
pub mod source;
pub mod status;
pub mod tempo;
pub mod varispeed;

pub use config::{EngineConfig, ExportFormat, OutputBackend, PlaybackConfig};
pub use engine::{AudioPlaybackEngine, EngineBuilder, PlaybackEvent, StartHandle};
pub use error::{EngineError, Result};
pub use tempo::{FreePitch, PitchCompensation, PreservePitch, TempoState};
