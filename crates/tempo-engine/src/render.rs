//! Render stage.
//!
//! One thread per session pulls fixed-size chunks from the player queue, runs them
//! through the variable-speed and time-pitch stages and pushes the result into the
//! mixer queue at the output rate. Stage parameters are re-read before every chunk,
//! so tempo changes land within one chunk plus the mixer queue depth. Failures, its
//! own or the decoder's, close the mixer queue through [`SharedAudio::fail`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};

use crate::config::PlaybackConfig;
use crate::pitch::PitchShifter;
use crate::queue::{PopStrategy, SharedAudio, calc_max_buffered_samples};
use crate::tempo::StageParams;
use crate::varispeed::Varispeed;

/// Handles owned by the player node while a render thread is alive.
pub struct RenderHandle {
    /// Mixer-side queue (output rate, source channel count).
    pub output: Arc<SharedAudio>,
    /// Source frames consumed so far.
    pub consumed_frames: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl RenderHandle {
    /// Close the mixer queue and wait for the render thread to exit.
    ///
    /// The caller closes the player queue first so a blocked pop returns.
    pub fn stop(mut self) {
        self.output.close_and_clear();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the render thread for one scheduled file.
pub fn spawn_render(
    input: Arc<SharedAudio>,
    src_rate: u32,
    dst_rate: u32,
    params: Arc<StageParams>,
    playback: &PlaybackConfig,
) -> Result<RenderHandle> {
    let channels = input.channels();
    let chunk_frames = playback.chunk_frames.max(1);
    let mut stages = Stages {
        varispeed: Varispeed::new(src_rate, dst_rate, channels, chunk_frames)?,
        shifter: PitchShifter::for_sample_rate(channels, dst_rate),
        params,
        buf: Vec::with_capacity(chunk_frames * channels * 2),
    };

    let max_buffered_samples =
        calc_max_buffered_samples(dst_rate, channels, playback.render_ahead_seconds);
    let output = Arc::new(SharedAudio::new(channels, max_buffered_samples));
    let consumed_frames = Arc::new(AtomicU64::new(0));

    let output_thread = output.clone();
    let consumed_thread = consumed_frames.clone();
    let join = thread::Builder::new()
        .name("render".into())
        .spawn(move || {
            match render_loop(&input, &output_thread, &consumed_thread, &mut stages) {
                // A decoder failure travels on once its buffered audio is rendered.
                Ok(()) => match input.failure() {
                    Some(reason) => output_thread.fail(reason),
                    None => output_thread.close(),
                },
                Err(e) => {
                    tracing::error!("render thread error: {e:#}");
                    output_thread.fail(format!("render: {e:#}"));
                }
            }
        })
        .context("spawn render thread")?;

    Ok(RenderHandle {
        output,
        consumed_frames,
        join: Some(join),
    })
}

struct Stages {
    varispeed: Varispeed,
    shifter: PitchShifter,
    params: Arc<StageParams>,
    buf: Vec<f32>,
}

impl Stages {
    fn apply_params(&mut self) -> Result<()> {
        let tempo = self.params.load();
        self.varispeed.set_rate(tempo.rate)?;
        self.shifter.set_cents(tempo.pitch_cents);
        Ok(())
    }

    fn run(&mut self, chunk: &[f32], tail: bool) -> Result<&[f32]> {
        self.apply_params()?;
        let out = if tail {
            self.varispeed.process_tail(chunk)?
        } else {
            self.varispeed.process_chunk(chunk)?
        };
        self.buf.clear();
        self.buf.extend_from_slice(out);
        self.shifter.process(&mut self.buf);
        Ok(&self.buf)
    }
}

fn render_loop(
    input: &Arc<SharedAudio>,
    output: &Arc<SharedAudio>,
    consumed: &AtomicU64,
    stages: &mut Stages,
) -> Result<()> {
    let channels = input.channels();
    let chunk_frames = stages.varispeed.chunk_frames();

    while let Some(chunk) = input.pop(PopStrategy::BlockingExact {
        frames: chunk_frames,
    }) {
        let rendered = stages.run(&chunk, false)?;
        output.push_interleaved_blocking(rendered);
        consumed.fetch_add(chunk_frames as u64, Ordering::Relaxed);
        if output.is_done() {
            return Ok(());
        }
    }

    // The player queue closed with fewer than `chunk_frames` left.
    if let Some(tail) = input.pop(PopStrategy::BlockingUpTo {
        max_frames: chunk_frames,
    }) {
        let frames = tail.len() / channels;
        let rendered = stages.run(&tail, true)?;
        output.push_interleaved_blocking(rendered);
        consumed.fetch_add(frames as u64, Ordering::Relaxed);
    }
    Ok(())
}
