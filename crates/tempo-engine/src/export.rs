//! Export step: transcode a resolved source into the session's scratch file.
//!
//! Exporters run on the session thread and must honour `cancel` promptly so a newer
//! session is never stuck behind an old transcode.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use thiserror::Error;

use crate::config::ExportFormat;
use crate::decode;
use crate::source::SourceAsset;

/// Why an export did not produce a file.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Tool(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(#[from] hound::Error),
}

/// Transcodes a source into a file the player node can schedule.
pub trait Exporter: Send + Sync {
    /// Container/codec this exporter writes.
    fn format(&self) -> ExportFormat;

    /// Write `source` to `dest`, replacing it. Returns [`ExportError::Cancelled`] once
    /// `cancel` is observed.
    fn export(&self, source: &SourceAsset, dest: &Path, cancel: &AtomicBool)
    -> Result<(), ExportError>;
}

const FFMPEG_POLL: Duration = Duration::from_millis(20);

/// ffmpeg diagnostics kept for the error message; the rest is read and dropped.
const STDERR_KEEP_BYTES: usize = 8 * 1024;

/// Read `pipe` to the end on a helper thread so the child never blocks on a full pipe.
fn drain_stderr(mut pipe: ChildStderr) -> std::io::Result<JoinHandle<String>> {
    thread::Builder::new()
        .name("ffmpeg-stderr".into())
        .spawn(move || {
            let mut kept = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let room = STDERR_KEEP_BYTES.saturating_sub(kept.len());
                        kept.extend_from_slice(&buf[..n.min(room)]);
                    }
                }
            }
            String::from_utf8_lossy(&kept).into_owned()
        })
}

/// AAC (`.m4a`) exporter backed by an external ffmpeg process.
pub struct FfmpegExporter {
    ffmpeg_path: PathBuf,
    bitrate: String,
}

impl FfmpegExporter {
    pub fn new(ffmpeg_path: PathBuf) -> Self {
        Self {
            ffmpeg_path,
            bitrate: "256k".to_string(),
        }
    }

    fn command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.arg("-hide_banner")
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            .arg("-y") // Overwrite output file
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg(&self.bitrate)
            // The partial path has no usable extension; name the muxer explicitly.
            .arg("-f")
            .arg("ipod")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Exporter for FfmpegExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Aac
    }

    fn export(
        &self,
        source: &SourceAsset,
        dest: &Path,
        cancel: &AtomicBool,
    ) -> Result<(), ExportError> {
        let mut child = self.command(source.path(), dest).spawn().map_err(|e| {
            ExportError::Tool(format!(
                "failed to run {}: {e}",
                self.ffmpeg_path.display()
            ))
        })?;
        tracing::debug!(pid = child.id(), src = %source.path().display(), "ffmpeg export started");

        let stderr = match child.stderr.take().map(drain_stderr).transpose() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        let status = loop {
            if cancel.load(Ordering::Relaxed) {
                let _ = child.kill();
                let _ = child.wait();
                // The reader thread ends on its own once the pipe closes.
                return Err(ExportError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(FFMPEG_POLL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(e.into());
                }
            }
        };

        let stderr = stderr
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(ExportError::Tool(format!(
                "ffmpeg exited with {status}: {}",
                stderr.trim()
            )));
        }
        if !stderr.trim().is_empty() {
            tracing::debug!("ffmpeg: {}", stderr.trim());
        }
        Ok(())
    }
}

/// In-process exporter: decodes with Symphonia and writes 32-bit float WAV.
#[derive(Clone, Copy, Debug, Default)]
pub struct WavExporter;

impl Exporter for WavExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Wav
    }

    fn export(
        &self,
        source: &SourceAsset,
        dest: &Path,
        cancel: &AtomicBool,
    ) -> Result<(), ExportError> {
        let decode::OpenTrack {
            mut format,
            mut decoder,
            info,
            ..
        } = decode::open_track(source.path()).map_err(|e| ExportError::Decode(format!("{e:#}")))?;

        let spec = hound::WavSpec {
            channels: info.channels as u16,
            sample_rate: info.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(dest, spec)?;
        let mut frames = 0u64;

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(ExportError::Cancelled);
            }
            let packet = match format.next_packet() {
                Ok(p) => p,
                Err(e) if decode::is_end_of_stream(&e) => break,
                Err(e) => return Err(ExportError::Decode(e.to_string())),
            };
            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    tracing::debug!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(e) => return Err(ExportError::Decode(e.to_string())),
            };
            let mut sample_buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
            sample_buf.copy_interleaved_ref(decoded);
            for sample in sample_buf.samples() {
                writer.write_sample(*sample)?;
            }
            frames += (sample_buf.samples().len() / info.channels.max(1)) as u64;
        }

        writer.finalize()?;
        if frames == 0 {
            return Err(ExportError::Decode("source produced no audio".to_string()));
        }
        tracing::debug!(frames, dest = %dest.display(), "wav export finished");
        Ok(())
    }
}

/// Default exporter for `format`.
pub fn exporter_for(format: ExportFormat, ffmpeg_path: &Path) -> Box<dyn Exporter> {
    match format {
        ExportFormat::Aac => Box::new(FfmpegExporter::new(ffmpeg_path.to_path_buf())),
        ExportFormat::Wav => Box::new(WavExporter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{unique_temp_dir, write_sine_wav};

    #[test]
    fn wav_export_preserves_frames_and_spec() {
        let dir = unique_temp_dir("export-wav");
        let src = dir.join("tone.wav");
        write_sine_wav(&src, 44_100, 2, 440.0, 22_050);
        let asset = SourceAsset::resolve(src.to_str().unwrap()).unwrap();

        let dest = dir.join("out.wav.partial");
        WavExporter
            .export(&asset, &dest, &AtomicBool::new(false))
            .unwrap();

        let reader = hound::WavReader::open(&dest).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 44_100);
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_format, hound::SampleFormat::Float);
        assert_eq!(reader.duration(), 22_050);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn wav_export_stops_when_cancelled() {
        let dir = unique_temp_dir("export-cancel");
        let src = dir.join("tone.wav");
        write_sine_wav(&src, 8_000, 1, 440.0, 8_000);
        let asset = SourceAsset::resolve(src.to_str().unwrap()).unwrap();

        let err = WavExporter
            .export(&asset, &dir.join("out.wav"), &AtomicBool::new(true))
            .unwrap_err();
        assert!(matches!(err, ExportError::Cancelled));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn ffmpeg_missing_binary_is_a_tool_error() {
        let dir = unique_temp_dir("export-ffmpeg");
        let src = dir.join("tone.wav");
        write_sine_wav(&src, 8_000, 1, 440.0, 800);
        let asset = SourceAsset::resolve(src.to_str().unwrap()).unwrap();

        let exporter = FfmpegExporter::new(dir.join("no-such-ffmpeg"));
        let err = exporter
            .export(&asset, &dir.join("out.m4a"), &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, ExportError::Tool(_)));
        assert!(err.to_string().contains("no-such-ffmpeg"));
        let _ = std::fs::remove_dir_all(dir);
    }

    /// Write an executable shell script standing in for ffmpeg.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Run an export on a side thread, giving up (and cancelling) after `limit`.
    #[cfg(unix)]
    fn export_within(
        exporter: FfmpegExporter,
        asset: SourceAsset,
        dest: PathBuf,
        limit: Duration,
    ) -> Option<Result<(), ExportError>> {
        let cancel = std::sync::Arc::new(AtomicBool::new(false));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let cancel_thread = cancel.clone();
        let join = thread::spawn(move || {
            // A freshly written script can briefly report "text file busy" while
            // another test thread forks.
            let mut result = exporter.export(&asset, &dest, &cancel_thread);
            for _ in 0..20 {
                match &result {
                    Err(ExportError::Tool(msg)) if msg.contains("busy") => {
                        thread::sleep(Duration::from_millis(50));
                        result = exporter.export(&asset, &dest, &cancel_thread);
                    }
                    _ => break,
                }
            }
            let _ = tx.send(result);
        });
        let result = rx.recv_timeout(limit).ok();
        cancel.store(true, Ordering::Relaxed);
        let _ = join.join();
        result
    }

    #[cfg(unix)]
    #[test]
    fn ffmpeg_flooding_stderr_still_reports_its_exit() {
        let dir = unique_temp_dir("export-ffmpeg-noisy");
        let src = dir.join("tone.wav");
        write_sine_wav(&src, 8_000, 1, 440.0, 800);
        let asset = SourceAsset::resolve(src.to_str().unwrap()).unwrap();
        // Far more than a pipe buffer holds.
        let ffmpeg = fake_ffmpeg(
            &dir,
            "i=0\nwhile [ $i -lt 4000 ]; do\n  echo \"[aac] error while decoding frame $i: invalid data found when processing input\" >&2\n  i=$((i+1))\ndone\nexit 1",
        );

        let result = export_within(
            FfmpegExporter::new(ffmpeg),
            asset,
            dir.join("out.m4a.partial"),
            Duration::from_secs(30),
        )
        .expect("export did not return after ffmpeg exited");
        let err = result.unwrap_err();
        assert!(matches!(err, ExportError::Tool(_)), "unexpected error {err}");
        let msg = err.to_string();
        assert!(msg.contains("exited with"), "{msg}");
        assert!(msg.contains("error while decoding frame 0"), "{msg}");
        assert!(msg.len() < STDERR_KEEP_BYTES + 256);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn ffmpeg_success_with_chatter_is_ok() {
        let dir = unique_temp_dir("export-ffmpeg-ok");
        let src = dir.join("tone.wav");
        write_sine_wav(&src, 8_000, 1, 440.0, 800);
        let asset = SourceAsset::resolve(src.to_str().unwrap()).unwrap();
        let ffmpeg = fake_ffmpeg(&dir, "echo \"[ipod] non-monotonic dts\" >&2\nexit 0");

        let result = export_within(
            FfmpegExporter::new(ffmpeg),
            asset,
            dir.join("out.m4a.partial"),
            Duration::from_secs(30),
        )
        .expect("export did not return after ffmpeg exited");
        assert!(result.is_ok());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn exporter_for_matches_format() {
        let ffmpeg = Path::new("ffmpeg");
        assert_eq!(exporter_for(ExportFormat::Aac, ffmpeg).format(), ExportFormat::Aac);
        assert_eq!(exporter_for(ExportFormat::Wav, ffmpeg).format(), ExportFormat::Wav);
    }
}
