use tempo_types::{EngineState, EngineStatus, PlaybackEndReason};

use crate::graph::PlayerSnapshot;
use crate::output::OutputFormat;
use crate::tempo::TempoState;
use crate::varispeed::{MAX_RATE, MIN_RATE};

/// Session-level status kept by the engine under its session lock.
#[derive(Debug, Default)]
pub struct SessionStatusState {
    /// Current transport state.
    pub state: EngineState,
    /// Session counter; bumped by every `start` and `stop` so stale sessions can tell.
    pub generation: u64,
    /// Locator of the session being loaded or played.
    pub now_playing: Option<String>,
    /// Terminal playback reason from the last session.
    pub end_reason: Option<PlaybackEndReason>,
}

/// Graph-level counters read when a snapshot is taken.
#[derive(Debug, Default)]
pub struct GraphCounters {
    pub player: PlayerSnapshot,
    pub output: Option<OutputFormat>,
    pub device: Option<String>,
    pub underrun_frames: u64,
    pub underrun_events: u64,
}

impl SessionStatusState {
    /// Combine session state, graph counters and tempo into an API snapshot.
    pub fn snapshot(&self, graph: &GraphCounters, tempo: TempoState) -> EngineStatus {
        let info = graph.player.info.as_ref();
        let active = matches!(self.state, EngineState::Playing | EngineState::Paused);
        let elapsed_ms = match (info, graph.output) {
            (Some(info), Some(out)) if active && info.sample_rate > 0 && out.sample_rate > 0 => {
                Some(elapsed_ms(
                    graph.player.consumed_frames,
                    graph.player.buffered_output_frames,
                    info.sample_rate,
                    out.sample_rate,
                    tempo.rate,
                ))
            }
            _ => None,
        };
        EngineStatus {
            state: self.state,
            generation: self.generation,
            now_playing: self.now_playing.clone(),
            elapsed_ms,
            duration_ms: info.and_then(|i| i.duration_ms),
            codec: info.and_then(|i| i.codec.clone()),
            source_rate_hz: info.map(|i| i.sample_rate),
            output_rate_hz: graph.output.map(|o| o.sample_rate),
            output_channels: graph.output.map(|o| o.channels),
            device: graph.device.clone(),
            tempo: tempo.into(),
            underrun_frames: active.then_some(graph.underrun_frames),
            underrun_events: active.then_some(graph.underrun_events),
            end_reason: self.end_reason,
        }
    }

    /// Clear session fields when playback ends, keeping the end reason.
    pub fn clear_playback(&mut self, reason: PlaybackEndReason) {
        self.state = EngineState::Idle;
        self.now_playing = None;
        self.end_reason = Some(reason);
    }
}

/// Source position heard at the output.
///
/// Frames still queued for the mixer have been rendered but not played; they are
/// converted back to source frames through the output rate and the rate the varispeed
/// stage actually applies.
fn elapsed_ms(consumed: u64, buffered_out: usize, src_rate: u32, out_rate: u32, rate: f32) -> u64 {
    let rate = if rate.is_finite() && rate > 0.0 {
        rate.clamp(MIN_RATE, MAX_RATE)
    } else {
        1.0
    };
    let pending_src = buffered_out as f64 * rate as f64 * src_rate as f64 / out_rate as f64;
    let heard = (consumed as f64 - pending_src).max(0.0);
    (heard * 1000.0 / src_rate as f64) as u64
}
