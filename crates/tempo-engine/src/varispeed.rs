//! Variable-speed stage.
//!
//! Uses Rubato's async sinc resampler to change playback rate (speed and pitch
//! together) and to convert from the file rate to the output rate in the same pass.
//! The effective ratio is `(dst_rate / src_rate) / rate`, so `rate = 2.0` emits half
//! as many frames for the same input.

use anyhow::{Context, Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

/// Slowest rate the stage renders; slower requests are clamped.
pub const MIN_RATE: f32 = 0.25;
/// Fastest rate the stage renders; faster requests are clamped.
pub const MAX_RATE: f32 = 4.0;

/// Streaming varispeed over interleaved `f32` chunks.
pub struct Varispeed {
    channels: usize,
    chunk_frames: usize,
    base_ratio: f64,
    rate: f32,
    resampler: Option<Async<f32>>,
    out: Vec<f32>,
    indexing: Indexing,
}

impl Varispeed {
    /// Create a stage converting `src_rate` → `dst_rate` with input chunks of `chunk_frames`.
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 {
            return Err(anyhow!("invalid sample rates {src_rate} -> {dst_rate}"));
        }
        let mut stage = Self {
            channels: channels.max(1),
            chunk_frames: chunk_frames.max(1),
            base_ratio: dst_rate as f64 / src_rate as f64,
            rate: 1.0,
            resampler: None,
            out: Vec::new(),
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        };
        if src_rate != dst_rate {
            stage.ensure_resampler()?;
            tracing::info!(from_hz = src_rate, to_hz = dst_rate, "resampling");
        } else {
            tracing::info!(rate_hz = dst_rate, "resample skipped");
        }
        Ok(stage)
    }

    /// Input chunk size expected by [`Varispeed::process_chunk`].
    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }

    /// Effective (clamped) rate currently applied.
    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// Whether input is passed through untouched.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    fn target_ratio(&self) -> f64 {
        self.base_ratio / self.rate as f64
    }

    fn ensure_resampler(&mut self) -> Result<()> {
        if self.resampler.is_some() {
            return Ok(());
        }
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let resampler = Async::<f32>::new_sinc(
            self.target_ratio(),
            (MAX_RATE / MIN_RATE) as f64,
            &params,
            self.chunk_frames,
            self.channels,
            FixedAsync::Input,
        )
        .context("varispeed resampler init")?;
        self.out = vec![0.0; resampler.output_frames_max() * self.channels];
        self.resampler = Some(resampler);
        Ok(())
    }

    /// Apply a new playback rate; values outside [`MIN_RATE`, `MAX_RATE`] are clamped.
    pub fn set_rate(&mut self, rate: f32) -> Result<()> {
        let rate = if rate.is_finite() {
            rate.clamp(MIN_RATE, MAX_RATE)
        } else {
            1.0
        };
        if rate == self.rate {
            return Ok(());
        }
        self.rate = rate;
        match self.resampler.as_mut() {
            Some(r) => {
                let ratio = self.base_ratio / rate as f64;
                r.set_resample_ratio(ratio, true)
                    .context("varispeed ratio update")?;
            }
            None => self.ensure_resampler()?,
        }
        Ok(())
    }

    /// Process exactly [`Varispeed::chunk_frames`] frames.
    pub fn process_chunk(&mut self, input: &[f32]) -> Result<&[f32]> {
        self.process(input, None)
    }

    /// Process a final partial chunk (fewer than `chunk_frames` frames).
    pub fn process_tail(&mut self, input: &[f32]) -> Result<&[f32]> {
        let frames = input.len() / self.channels;
        self.process(input, Some(frames))
    }

    fn process(&mut self, input: &[f32], partial: Option<usize>) -> Result<&[f32]> {
        let channels = self.channels;
        let Some(resampler) = self.resampler.as_mut() else {
            self.out.clear();
            self.out.extend_from_slice(input);
            return Ok(&self.out);
        };

        let frames = input.len() / channels;
        let input_adapter = InterleavedSlice::new(input, channels, frames)
            .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
        let out_capacity_frames = self.out.len() / channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out, channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = partial;

        let (_nbr_in, nbr_out) = resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .context("varispeed process")?;

        Ok(&self.out[..nbr_out * channels])
    }
}
