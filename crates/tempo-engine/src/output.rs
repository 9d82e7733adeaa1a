//! Output backends that drive the mixer node.
//!
//! - [`CpalOutput`] opens a device stream. The stream lives on its own thread
//!   because `cpal::Stream` is not `Send` on every host.
//! - [`NullOutput`] is a headless sink that consumes audio on a timer and discards it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use cpal::traits::StreamTrait;
use crossbeam_channel::{Sender, bounded};

use crate::device;
use crate::mixer::{MixState, MixerNode};
use crate::playback;

/// Sample rate and channel count the mixer renders at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A sink the graph's mixer renders into.
pub trait AudioOutput: Send {
    /// Start pulling from `mixer`. Returns the format the mixer must render at.
    fn start(&mut self, mixer: Arc<MixerNode>) -> Result<OutputFormat>;

    /// Whether a previously started output is still delivering audio.
    fn is_running(&self) -> bool;

    /// Stop pulling and release the device. Idempotent.
    fn stop(&mut self);

    /// Device label for status payloads.
    fn device_name(&self) -> Option<String> {
        None
    }
}

struct OutputThread {
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
    failed: Arc<AtomicBool>,
}

impl OutputThread {
    fn is_alive(&self) -> bool {
        !self.failed.load(Ordering::Relaxed)
            && self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    fn shutdown(&mut self) {
        drop(self.stop_tx.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// CPAL device output.
pub struct CpalOutput {
    device: Option<String>,
    preferred_buffer_frames: u32,
    running: Option<OutputThread>,
    device_label: Option<String>,
}

impl CpalOutput {
    /// `device` is a case-insensitive name substring; `None` picks the host default.
    pub fn new(device: Option<String>, preferred_buffer_frames: u32) -> Self {
        Self {
            device,
            preferred_buffer_frames,
            running: None,
            device_label: None,
        }
    }
}

impl AudioOutput for CpalOutput {
    fn start(&mut self, mixer: Arc<MixerNode>) -> Result<OutputFormat> {
        self.stop();

        let needle = self.device.clone();
        let preferred = self.preferred_buffer_frames;
        let failed = Arc::new(AtomicBool::new(false));
        let failed_thread = failed.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(OutputFormat, Option<String>)>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let join = thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || {
                let opened = (|| -> Result<(cpal::Stream, OutputFormat, Option<String>)> {
                    let host = cpal::default_host();
                    let device = device::pick_device(&host, needle.as_deref())?;
                    let name = device::device_name(&device);
                    let target_rate = device::default_output_rate(&device);
                    let config = device::pick_output_config(&device, target_rate)?;
                    let mut stream_config = config.config();
                    if let Some(buffer_size) = device::pick_buffer_size(&config, preferred) {
                        stream_config.buffer_size = buffer_size;
                    }
                    tracing::info!(
                        device = name.as_deref().unwrap_or("<unknown>"),
                        rate_hz = stream_config.sample_rate,
                        channels = stream_config.channels,
                        format = ?config.sample_format(),
                        buffer = ?stream_config.buffer_size,
                        "output stream"
                    );
                    let stream = playback::build_output_stream(
                        &device,
                        &stream_config,
                        config.sample_format(),
                        &mixer,
                        failed_thread,
                    )?;
                    stream.play().context("start output stream")?;
                    let format = OutputFormat {
                        sample_rate: stream_config.sample_rate,
                        channels: stream_config.channels,
                    };
                    Ok((stream, format, name))
                })();

                match opened {
                    Ok((stream, format, name)) => {
                        let _ = ready_tx.send(Ok((format, name)));
                        // Blocks until the owner drops `stop_tx`.
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .context("spawn output thread")?;

        let mut thread = OutputThread {
            stop_tx: Some(stop_tx),
            join: Some(join),
            failed,
        };
        match ready_rx.recv() {
            Ok(Ok((format, name))) => {
                self.device_label = name;
                self.running = Some(thread);
                Ok(format)
            }
            Ok(Err(e)) => {
                thread.shutdown();
                Err(e)
            }
            Err(_) => {
                thread.shutdown();
                Err(anyhow!("output thread exited before opening the device"))
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(OutputThread::is_alive)
    }

    fn stop(&mut self) {
        if let Some(mut thread) = self.running.take() {
            thread.shutdown();
        }
    }

    fn device_name(&self) -> Option<String> {
        self.device_label.clone()
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Headless output: renders `block` frames every tick and discards them.
///
/// `speed` > 1 consumes audio faster than real time.
pub struct NullOutput {
    format: OutputFormat,
    speed: f32,
    running: Option<OutputThread>,
}

const NULL_TICK: Duration = Duration::from_millis(10);

impl NullOutput {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            format: OutputFormat {
                sample_rate: sample_rate.max(1),
                channels: channels.max(1),
            },
            speed: 1.0,
            running: None,
        }
    }

    /// Consume audio `speed` times faster than real time.
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = if speed.is_finite() && speed > 0.0 {
            speed
        } else {
            1.0
        };
        self
    }
}

impl AudioOutput for NullOutput {
    fn start(&mut self, mixer: Arc<MixerNode>) -> Result<OutputFormat> {
        self.stop();

        let format = self.format;
        let tick = NULL_TICK.div_f32(self.speed);
        let block_frames =
            ((format.sample_rate as u64 * NULL_TICK.as_millis() as u64) / 1000).max(1) as usize;
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let join = thread::Builder::new()
            .name("null-output".into())
            .spawn(move || {
                let channels = format.channels as usize;
                let mut buf = vec![0.0f32; block_frames * channels];
                let mut st = MixState::default();
                let mut next = Instant::now();
                loop {
                    mixer.render(&mut buf, channels, &mut st);
                    next += tick;
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }
            })
            .context("spawn null output thread")?;

        tracing::info!(
            rate_hz = format.sample_rate,
            channels = format.channels,
            speed = self.speed,
            "null output started"
        );
        self.running = Some(OutputThread {
            stop_tx: Some(stop_tx),
            join: Some(join),
            failed: Arc::new(AtomicBool::new(false)),
        });
        Ok(format)
    }

    fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(OutputThread::is_alive)
    }

    fn stop(&mut self) {
        if let Some(mut thread) = self.running.take() {
            thread.shutdown();
        }
    }

    fn device_name(&self) -> Option<String> {
        Some("null".to_string())
    }
}

impl Drop for NullOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SharedAudio;

    #[test]
    fn null_output_drains_the_mixer() {
        let mixer = Arc::new(MixerNode::new(256));
        let q = Arc::new(SharedAudio::new(2, 48_000 * 2));
        q.push_interleaved_blocking(&vec![0.1; 4_800 * 2]);
        q.close();
        mixer.set_input(Some(q.clone()));

        let mut out = NullOutput::new(48_000, 2).with_speed(20.0);
        let format = out.start(mixer.clone()).unwrap();
        assert_eq!(
            format,
            OutputFormat {
                sample_rate: 48_000,
                channels: 2
            }
        );
        assert!(out.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !q.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(q.is_finished());
        assert_eq!(mixer.played_frames(), 4_800);

        out.stop();
        assert!(!out.is_running());
    }

    #[test]
    fn null_output_restarts_after_stop() {
        let mixer = Arc::new(MixerNode::new(256));
        let mut out = NullOutput::new(44_100, 1);
        out.start(mixer.clone()).unwrap();
        out.stop();
        out.start(mixer).unwrap();
        assert!(out.is_running());
    }
}
