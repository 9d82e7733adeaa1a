use tempo_engine::scratch::remove_scratch_files;
use tempo_engine::{EngineConfig, ExportFormat, OutputBackend, PlaybackConfig};

use crate::cli::{Args, ExportArg, OutputArg};

/// Map command-line flags onto the engine configuration.
pub fn engine_config(args: &Args) -> EngineConfig {
    let defaults = PlaybackConfig::default();
    EngineConfig {
        scratch_dir: args.scratch_dir.clone(),
        export_format: match args.export_format {
            ExportArg::Aac => ExportFormat::Aac,
            ExportArg::Wav => ExportFormat::Wav,
        },
        ffmpeg_path: args.ffmpeg.clone(),
        device: normalize_device_name(args.device.clone()),
        output: match args.output {
            OutputArg::Cpal => OutputBackend::Cpal,
            OutputArg::Null => OutputBackend::Null,
        },
        playback: PlaybackConfig {
            chunk_frames: args.chunk_frames.max(1),
            refill_max_frames: args.refill_max_frames.max(1),
            buffer_seconds: args.buffer_seconds,
            ..defaults
        },
    }
}

/// Scratch cleanup for the Ctrl-C handler, which exits without dropping the engine.
///
/// `--scratch-dir` may name a directory the user keeps other files in, so only the
/// engine's own files go, and the directory only when it is left empty.
pub fn interrupt_cleanup(config: &EngineConfig) -> impl Fn() + Send + 'static {
    let dir = config.resolved_scratch_dir();
    move || remove_scratch_files(&dir)
}

pub fn normalize_device_name(device: Option<String>) -> Option<String> {
    device.and_then(|name| {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn normalize_device_name_trims_and_drops_empty() {
        assert_eq!(normalize_device_name(None), None);
        assert_eq!(normalize_device_name(Some("".to_string())), None);
        assert_eq!(normalize_device_name(Some("  ".to_string())), None);
        assert_eq!(
            normalize_device_name(Some("  USB DAC ".to_string())),
            Some("USB DAC".to_string())
        );
    }

    #[test]
    fn interrupt_cleanup_keeps_user_files_in_scratch_dir() {
        let dir = std::env::temp_dir().join(format!("tempo-cli-scratch-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("albums")).unwrap();
        std::fs::write(dir.join("albums").join("song.flac"), b"keep").unwrap();
        std::fs::write(dir.join("playback_live_2019.flac"), b"keep").unwrap();
        std::fs::write(dir.join("playback.m4a"), b"scratch").unwrap();
        std::fs::write(dir.join("playback.m4a.partial"), b"scratch").unwrap();

        let args = Args::try_parse_from([
            "tempo-player",
            "--scratch-dir",
            dir.to_str().unwrap(),
            "list",
            "/music",
        ])
        .unwrap();
        interrupt_cleanup(&engine_config(&args))();

        assert!(dir.join("albums").join("song.flac").exists());
        assert!(dir.join("playback_live_2019.flac").exists());
        assert!(!dir.join("playback.m4a").exists());
        assert!(!dir.join("playback.m4a.partial").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn engine_config_maps_flags() {
        let args = Args::try_parse_from([
            "tempo-player",
            "--device",
            " usb ",
            "--output",
            "null",
            "--export-format",
            "wav",
            "--scratch-dir",
            "/tmp/tp",
            "--chunk-frames",
            "0",
            "list",
            "/music",
        ])
        .unwrap();
        let cfg = engine_config(&args);
        assert_eq!(cfg.device.as_deref(), Some("usb"));
        assert_eq!(cfg.output, OutputBackend::Null);
        assert_eq!(cfg.export_format, ExportFormat::Wav);
        assert_eq!(cfg.scratch_dir, Some(std::path::PathBuf::from("/tmp/tp")));
        assert_eq!(cfg.playback.chunk_frames, 1);
        assert_eq!(
            cfg.playback.render_ahead_seconds,
            PlaybackConfig::default().render_ahead_seconds
        );
    }
}
