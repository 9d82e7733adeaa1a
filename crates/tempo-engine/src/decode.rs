//! Streaming audio decode stage.
//!
//! Uses Symphonia to:
//! - probe a container/codec and report what it holds
//! - decode packets into interleaved `f32` samples
//! - push samples into a bounded [`SharedAudio`] queue from a background thread

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::queue::{SharedAudio, calc_max_buffered_samples};

/// Metadata captured while probing a file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceInfo {
    /// Codec name (best-effort).
    pub codec: Option<String>,
    /// Source bit depth (best-effort).
    pub bit_depth: Option<u16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: usize,
    /// Total duration when the container reports it.
    pub duration_ms: Option<u64>,
}

/// A file opened for sequential streaming reads.
///
/// Decoding starts as soon as the file is opened; the bounded queue throttles the
/// decoder thread until the player drains it.
pub struct ScheduledFile {
    pub spec: SignalSpec,
    pub queue: Arc<SharedAudio>,
    pub info: SourceInfo,
}

/// A probed file with a ready decoder for its default track.
pub(crate) struct OpenTrack {
    pub(crate) format: Box<dyn FormatReader>,
    pub(crate) decoder: Box<dyn Decoder>,
    pub(crate) spec: SignalSpec,
    pub(crate) info: SourceInfo,
}

/// Probe `path` and confirm it holds a decodable default track.
///
/// A decoder is instantiated (and dropped) so unsupported codecs fail here rather
/// than halfway through playback.
pub fn probe_file(path: &Path) -> Result<SourceInfo> {
    open_track(path).map(|track| track.info)
}

/// Open `path` and start a background decoder thread streaming interleaved `f32`.
///
/// The queue is closed on EOF or when the consumer closes it first. A read or decoder
/// error closes it through [`SharedAudio::fail`].
pub fn open_streaming(path: &Path, buffer_seconds: f32) -> Result<ScheduledFile> {
    let OpenTrack {
        format,
        decoder,
        spec,
        info,
    } = open_track(path)?;

    let max_buffered_samples =
        calc_max_buffered_samples(info.sample_rate, info.channels, buffer_seconds);
    let shared = Arc::new(SharedAudio::new(info.channels, max_buffered_samples));

    let shared_for_thread = shared.clone();
    thread::Builder::new()
        .name("decode".into())
        .spawn(move || {
            match decode_format_loop(format, decoder, &shared_for_thread) {
                Ok(()) => shared_for_thread.close(),
                Err(e) => {
                    tracing::error!("decoder thread error: {e:#}");
                    shared_for_thread.fail(format!("decode: {e:#}"));
                }
            }
        })
        .context("spawn decoder thread")?;

    Ok(ScheduledFile {
        spec,
        queue: shared,
        info,
    })
}

pub(crate) fn open_track(path: &Path) -> Result<OpenTrack> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("unrecognized container")?;

    let format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;
    let codec_params = track.codec_params.clone();
    let info = source_info_from_params(&codec_params)?;
    let channels = codec_params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?;
    let spec = SignalSpec::new(info.sample_rate, channels);

    let decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .context("no decoder for codec")?;

    Ok(OpenTrack {
        format,
        decoder,
        spec,
        info,
    })
}

fn source_info_from_params(params: &CodecParameters) -> Result<SourceInfo> {
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let channels = params
        .channels
        .ok_or_else(|| anyhow!("Unknown channels"))?
        .count();
    Ok(SourceInfo {
        codec: codec_name_from_params(params),
        bit_depth: params.bits_per_sample.map(|b| b as u16),
        sample_rate,
        channels,
        duration_ms: duration_ms_from_codec_params(params),
    })
}

/// Decode packets and push interleaved `f32` into `shared` until EOF or close.
fn decode_format_loop(
    mut format: Box<dyn FormatReader>,
    mut decoder: Box<dyn Decoder>,
    shared: &Arc<SharedAudio>,
) -> Result<()> {
    loop {
        if shared.is_done() {
            break;
        }

        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(e) if is_end_of_stream(&e) => break,
            Err(e) => return Err(e).context("read packet"),
        };

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);

        shared.push_interleaved_blocking(sample_buf.samples());
    }

    Ok(())
}

/// Symphonia reports the end of a stream as an `UnexpectedEof` I/O error.
pub(crate) fn is_end_of_stream(err: &SymphoniaError) -> bool {
    matches!(err, SymphoniaError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

/// Best-effort duration in milliseconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label used for status payloads.
fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}
