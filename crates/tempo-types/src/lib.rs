use serde::{Deserialize, Serialize};

/// Transport state of a playback engine.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Nothing scheduled.
    #[default]
    Idle,
    /// A source is being exported and prepared for playback.
    Loading,
    /// Audio is being rendered to the output.
    Playing,
    /// The player node is halted; the graph stays up.
    Paused,
}

/// Reason why the last playback session ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of the scheduled file.
    Eof,
    /// Export, decode or output error interrupted the session.
    Error,
    /// Stopped by a command or replaced by a newer session.
    Stopped,
}

/// Tempo and pitch values currently applied to the graph.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct TempoStatus {
    /// Playback rate of the variable-speed stage (1.0 = unchanged).
    pub rate: f32,
    /// Pitch shift of the time-pitch stage in cents.
    pub pitch_cents: f32,
}

impl Default for TempoStatus {
    fn default() -> Self {
        Self {
            rate: 1.0,
            pitch_cents: 0.0,
        }
    }
}

/// Playback status reported by an engine instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineStatus {
    /// Current transport state.
    pub state: EngineState,
    /// Session counter; bumped by every `start` and `stop` (0 before the first).
    pub generation: u64,
    /// Locator of the source being played, if any.
    pub now_playing: Option<String>,
    /// Elapsed source time in milliseconds.
    pub elapsed_ms: Option<u64>,
    /// Total source duration in milliseconds.
    pub duration_ms: Option<u64>,
    /// Codec of the transcoded file (for example `AAC`).
    pub codec: Option<String>,
    /// Sample rate of the transcoded file (Hz).
    pub source_rate_hz: Option<u32>,
    /// Output device sample rate (Hz).
    pub output_rate_hz: Option<u32>,
    /// Output channel count.
    pub output_channels: Option<u16>,
    /// Output device name, if known.
    pub device: Option<String>,
    /// Tempo/pitch pair in effect.
    pub tempo: TempoStatus,
    /// Frames of silence emitted because the render queue ran dry.
    pub underrun_frames: Option<u64>,
    /// Number of underrun incidents.
    pub underrun_events: Option<u64>,
    /// End reason once the last session is over.
    pub end_reason: Option<PlaybackEndReason>,
}
