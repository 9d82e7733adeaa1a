//! CPAL output stream.
//!
//! Builds the device stream whose real-time callback pulls from the [`MixerNode`]
//! and converts `f32` samples to the device sample format.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::mixer::{MixState, MixerNode};

/// Build a CPAL output stream that plays whatever the mixer renders.
///
/// `failed` is raised from the error callback so the owner can tell the stream died.
///
/// ## Real-time constraints
/// The callback never waits on a lock or condition variable. It only allocates when
/// the device asks for a larger buffer than any previous callback.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    mixer: &Arc<MixerNode>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, mixer, failed),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, mixer, failed),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, mixer, failed),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, mixer, failed),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: &Arc<MixerNode>,
    failed: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let mixer_cb = mixer.clone();
    let mut state = MixState::default();
    let mut scratch: Vec<f32> = Vec::new();

    let err_fn = move |err| {
        tracing::warn!("stream error: {err}");
        failed.store(true, Ordering::Relaxed);
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            if scratch.len() < data.len() {
                scratch.resize(data.len(), 0.0);
            }
            let buf = &mut scratch[..data.len()];
            mixer_cb.render(buf, channels_out, &mut state);
            for (dst, src) in data.iter_mut().zip(buf.iter()) {
                *dst = <T as cpal::Sample>::from_sample::<f32>(*src);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}
