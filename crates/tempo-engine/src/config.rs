use std::path::PathBuf;

/// Playback tuning parameters shared by decode/varispeed/playback stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Decoder/resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Decoded audio buffered ahead of the player node, in seconds.
    pub buffer_seconds: f32,
    /// Rendered audio buffered ahead of the output, in seconds.
    ///
    /// Tempo changes become audible after at most this much audio.
    pub render_ahead_seconds: f32,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
            render_ahead_seconds: 0.1,
        }
    }
}

/// Container/codec of the per-session transcoded file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExportFormat {
    /// AAC in an MPEG-4 audio container (`.m4a`), produced by ffmpeg.
    #[default]
    Aac,
    /// 32-bit float PCM WAV produced in-process.
    Wav,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Aac => "m4a",
            ExportFormat::Wav => "wav",
        }
    }
}

/// Which output backend the graph renders into.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputBackend {
    /// A CPAL device, optionally selected by case-insensitive name substring.
    #[default]
    Cpal,
    /// Headless sink that consumes audio in real time and discards it.
    Null,
}

/// Engine-level configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Directory for transcoded files. Defaults to a per-process dir under the system temp dir.
    pub scratch_dir: Option<PathBuf>,
    /// Target format of the export step.
    pub export_format: ExportFormat,
    /// ffmpeg executable used by the AAC exporter.
    pub ffmpeg_path: PathBuf,
    /// Output device name substring (CPAL backend only).
    pub device: Option<String>,
    /// Output backend.
    pub output: OutputBackend,
    /// Stage tuning.
    pub playback: PlaybackConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            export_format: ExportFormat::default(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            device: None,
            output: OutputBackend::default(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Resolve the scratch directory, falling back to `<tmp>/tempo-player-<pid>`.
    pub fn resolved_scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("tempo-player-{}", std::process::id()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_format_extensions() {
        assert_eq!(ExportFormat::Aac.extension(), "m4a");
        assert_eq!(ExportFormat::Wav.extension(), "wav");
    }

    #[test]
    fn scratch_dir_defaults_under_temp() {
        let cfg = EngineConfig::default();
        let dir = cfg.resolved_scratch_dir();
        assert!(dir.starts_with(std::env::temp_dir()));
        assert!(
            dir.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("tempo-player-"))
        );
    }

    #[test]
    fn explicit_scratch_dir_wins() {
        let cfg = EngineConfig {
            scratch_dir: Some(PathBuf::from("/var/tmp/x")),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.resolved_scratch_dir(), PathBuf::from("/var/tmp/x"));
    }
}
