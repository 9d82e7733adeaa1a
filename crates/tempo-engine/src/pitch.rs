//! Time-pitch stage.
//!
//! Streaming pitch shifter that keeps duration: every input frame yields exactly one
//! output frame. Two read taps sweep a per-channel delay line at `ratio` times the
//! write speed; their gains are complementary `sin²`/`cos²` windows so each tap is
//! silent at the instant it wraps.

use crate::tempo::cents_to_ratio;

/// Pitch range accepted by the stage, in cents (two octaves either way).
pub const MAX_PITCH_CENTS: f32 = 2400.0;

/// Grain length used by [`PitchShifter::for_sample_rate`].
const GRAIN_SECONDS: f32 = 0.04;

/// Interleaved multichannel delay-line pitch shifter.
pub struct PitchShifter {
    channels: usize,
    window: f32,
    lines: Vec<Vec<f32>>,
    write_pos: usize,
    delay: f32,
    cents: f32,
    ratio: f32,
}

impl PitchShifter {
    /// Create a shifter with a grain of `window_frames` frames.
    pub fn new(channels: usize, window_frames: usize) -> Self {
        let channels = channels.max(1);
        let window_frames = window_frames.max(16);
        Self {
            channels,
            window: window_frames as f32,
            lines: vec![vec![0.0; window_frames + 4]; channels],
            write_pos: 0,
            delay: 0.0,
            cents: 0.0,
            ratio: 1.0,
        }
    }

    /// Create a shifter with a ~40 ms grain for `sample_rate`.
    pub fn for_sample_rate(channels: usize, sample_rate: u32) -> Self {
        Self::new(channels, (sample_rate as f32 * GRAIN_SECONDS) as usize)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Current shift in cents after clamping.
    pub fn cents(&self) -> f32 {
        self.cents
    }

    /// Set the shift in cents; values outside ±2400 are clamped.
    pub fn set_cents(&mut self, cents: f32) {
        let cents = if cents.is_finite() {
            cents.clamp(-MAX_PITCH_CENTS, MAX_PITCH_CENTS)
        } else {
            0.0
        };
        self.cents = cents;
        self.ratio = cents_to_ratio(cents);
    }

    /// Whether the stage currently passes audio through untouched.
    pub fn is_bypassed(&self) -> bool {
        self.cents == 0.0
    }

    /// Process interleaved samples in place.
    pub fn process(&mut self, samples: &mut [f32]) {
        let bypass = self.is_bypassed();
        let len = self.lines[0].len();
        let half = self.window * 0.5;
        let step = 1.0 - self.ratio;

        for frame in samples.chunks_exact_mut(self.channels) {
            for (ch, sample) in frame.iter_mut().enumerate() {
                self.lines[ch][self.write_pos] = *sample;
            }

            if !bypass {
                let delay_a = self.delay;
                let delay_b = wrap(delay_a + half, self.window);
                let gain_a = grain_gain(delay_a, self.window);
                let gain_b = 1.0 - gain_a;
                for (ch, sample) in frame.iter_mut().enumerate() {
                    let line = &self.lines[ch];
                    *sample = gain_a * read_tap(line, self.write_pos, delay_a)
                        + gain_b * read_tap(line, self.write_pos, delay_b);
                }
                self.delay = wrap(self.delay + step, self.window);
            }

            self.write_pos = (self.write_pos + 1) % len;
        }
    }
}

fn wrap(value: f32, window: f32) -> f32 {
    let v = value % window;
    if v < 0.0 { v + window } else { v }
}

fn grain_gain(delay: f32, window: f32) -> f32 {
    let s = (std::f32::consts::PI * delay / window).sin();
    s * s
}

/// Linear-interpolated read `delay` frames behind `write_pos`.
fn read_tap(line: &[f32], write_pos: usize, delay: f32) -> f32 {
    let len = line.len();
    let mut pos = write_pos as f32 - delay;
    if pos < 0.0 {
        pos += len as f32;
    }
    let i0 = (pos as usize) % len;
    let frac = pos - pos.floor();
    let i1 = (i0 + 1) % len;
    line[i0] * (1.0 - frac) + line[i1] * frac
}
