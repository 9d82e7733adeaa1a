//! Output mixer node.
//!
//! The mixer is the only node an output backend talks to. Each output callback asks
//! it to fill an interleaved `f32` buffer; the mixer:
//! - refills a small local buffer from the current render queue without blocking
//! - applies basic channel mapping (mono↔stereo, best-effort otherwise)
//! - applies the output volume
//! - emits silence while paused, between sessions and on underrun

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::queue::{PopStrategy, SharedAudio};

/// Shared mixer state, written by the graph and read by the output callback.
pub struct MixerNode {
    input: Mutex<Option<Arc<SharedAudio>>>,
    epoch: AtomicU64,
    paused: AtomicBool,
    volume_bits: AtomicU32,
    refill_max_frames: usize,
    played_frames: AtomicU64,
    underrun_frames: AtomicU64,
    underrun_events: AtomicU64,
}

/// Callback-local buffer state.
///
/// Owned by whichever thread drives the output, so the hot path only touches the
/// shared queue once per refill.
#[derive(Default)]
pub struct MixState {
    epoch: u64,
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

impl MixerNode {
    pub fn new(refill_max_frames: usize) -> Self {
        Self {
            input: Mutex::new(None),
            epoch: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            refill_max_frames: refill_max_frames.max(1),
            played_frames: AtomicU64::new(0),
            underrun_frames: AtomicU64::new(0),
            underrun_events: AtomicU64::new(0),
        }
    }

    /// Route a new render queue into the mixer (or disconnect with `None`).
    ///
    /// Resets counters and invalidates samples the callback still holds locally.
    pub fn set_input(&self, input: Option<Arc<SharedAudio>>) {
        let mut slot = self.input.lock().unwrap_or_else(|e| e.into_inner());
        *slot = input;
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.played_frames.store(0, Ordering::Relaxed);
        self.underrun_frames.store(0, Ordering::Relaxed);
        self.underrun_events.store(0, Ordering::Relaxed);
    }

    pub fn has_input(&self) -> bool {
        self.input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// When paused the callback outputs silence and does not drain the queue.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Set output gain, clamped to `0.0..=1.0`.
    pub fn set_volume(&self, volume: f32) {
        let v = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.volume_bits.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    /// Output frames produced from the current input.
    pub fn played_frames(&self) -> u64 {
        self.played_frames.load(Ordering::Relaxed)
    }

    pub fn underrun_frames(&self) -> u64 {
        self.underrun_frames.load(Ordering::Relaxed)
    }

    pub fn underrun_events(&self) -> u64 {
        self.underrun_events.load(Ordering::Relaxed)
    }

    /// Fill `out` (interleaved, `out_channels` wide) from the current input.
    ///
    /// Never blocks: if the input slot is contended the buffer is filled with silence.
    pub fn render(&self, out: &mut [f32], out_channels: usize, st: &mut MixState) {
        let out_channels = out_channels.max(1);
        let epoch = self.epoch.load(Ordering::Acquire);
        if st.epoch != epoch {
            st.epoch = epoch;
            st.pos = 0;
            st.src.clear();
        }

        if self.is_paused() {
            out.fill(0.0);
            return;
        }
        let input = match self.input.try_lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let Some(input) = input else {
            out.fill(0.0);
            return;
        };

        let volume = self.volume();
        let frames = out.len() / out_channels;
        let mut filled_frames = 0usize;

        for frame in 0..frames {
            if st.pos >= st.src.len() {
                st.pos = 0;
                st.src.clear();
                if let Some(v) = input.pop(PopStrategy::NonBlocking {
                    max_frames: self.refill_max_frames,
                }) {
                    st.src = v;
                    st.src_channels = input.channels();
                } else {
                    // End of stream is not an underrun.
                    if !input.is_done() {
                        self.underrun_events.fetch_add(1, Ordering::Relaxed);
                        let remaining = frames.saturating_sub(frame);
                        self.underrun_frames
                            .fetch_add(remaining as u64, Ordering::Relaxed);
                    }
                    out[frame * out_channels..].fill(0.0);
                    break;
                }
            }
            for ch in 0..out_channels {
                out[frame * out_channels + ch] =
                    next_sample_mapped_from_vec(st, out_channels, ch) * volume;
            }
            filled_frames += 1;
        }

        if filled_frames > 0 {
            self.played_frames
                .fetch_add(filled_frames as u64, Ordering::Relaxed);
        }
    }
}

/// Read one output sample for `dst_ch`, applying a simple channel mapping.
///
/// - mono → stereo: duplicate channel 0
/// - stereo → mono: average L/R
/// - other layouts: clamp to the available channels
///
/// `st.pos` advances once per destination frame (after the last channel).
fn next_sample_mapped_from_vec(st: &mut MixState, dst_channels: usize, dst_ch: usize) -> f32 {
    if st.pos >= st.src.len() {
        return 0.0;
    }

    let frame_start = st.pos;
    let get_src = |ch: usize, st: &MixState| -> f32 {
        if ch < st.src_channels && frame_start + ch < st.src.len() {
            st.src[frame_start + ch]
        } else {
            0.0
        }
    };

    let out = match (st.src_channels, dst_channels) {
        (2, 1) => 0.5 * (get_src(0, st) + get_src(1, st)),
        (1, _) => get_src(0, st),
        _ => get_src(dst_ch.min(st.src_channels.saturating_sub(1)), st),
    };

    if dst_ch + 1 == dst_channels {
        st.pos += st.src_channels.max(1);
    }
    out
}
