//! Output device discovery and selection.
//!
//! Thin wrappers around CPAL for:
//! - listing available output devices
//! - selecting either the default device or a device by substring match
//! - choosing a stream config and callback buffer size for the mixer

use std::cmp::Reverse;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait};

/// Pick the first output device whose name contains `needle` (case-insensitive), or the
/// host default device when `needle` is `None`.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device> {
    let Some(needle) = needle else {
        return host
            .default_output_device()
            .ok_or_else(|| anyhow!("No default output device"));
    };
    host.output_devices()
        .context("No output devices")?
        .find(|d| device_name(d).is_some_and(|name| matches_device_name(&name, needle)))
        .ok_or_else(|| anyhow!("No output device matched: {needle}"))
}

/// Pick the best supported output config for the device.
///
/// If `target_rate` is `Some`, prefer a range containing it, otherwise the closest rate
/// below it. If `None`, choose the highest supported rate. Ties go to float formats.
pub fn pick_output_config(
    device: &cpal::Device,
    target_rate: Option<u32>,
) -> Result<cpal::SupportedStreamConfig> {
    device
        .supported_output_configs()
        .context("query supported output configs")?
        .map(|range| {
            let rate =
                pick_rate_for_range(range.min_sample_rate(), range.max_sample_rate(), target_rate);
            let rank = ConfigRank::new(rate, target_rate, range.sample_format());
            (rank, range.with_sample_rate(rate))
        })
        .min_by_key(|(rank, _)| *rank)
        .map(|(_, cfg)| cfg)
        .ok_or_else(|| anyhow!("No supported output configs"))
}

/// Ordering key for candidate configs; smaller is better.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ConfigRank {
    /// Only a rate above the target was available in this range.
    above_target: bool,
    rate: Reverse<u32>,
    format: u8,
}

impl ConfigRank {
    fn new(rate: u32, target_rate: Option<u32>, format: cpal::SampleFormat) -> Self {
        Self {
            above_target: target_rate.is_some_and(|t| rate > t),
            rate: Reverse(rate),
            format: sample_format_rank(format),
        }
    }
}

/// Sample rate the device runs at by default, if it reports one.
pub fn default_output_rate(device: &cpal::Device) -> Option<u32> {
    device
        .default_output_config()
        .ok()
        .map(|cfg| cfg.sample_rate())
}

/// Pick a callback buffer size close to `preferred_frames`.
///
/// Small buffers keep tempo and pause changes responsive; the value is clamped to the
/// range the device advertises. Returns `None` when the device only reports `Unknown`
/// so CPAL uses its default.
pub fn pick_buffer_size(
    config: &cpal::SupportedStreamConfig,
    preferred_frames: u32,
) -> Option<cpal::BufferSize> {
    match config.buffer_size() {
        cpal::SupportedBufferSize::Range { min, max } => Some(cpal::BufferSize::Fixed(
            clamp_buffer_frames(preferred_frames, *min, *max),
        )),
        cpal::SupportedBufferSize::Unknown => None,
    }
}

fn clamp_buffer_frames(preferred: u32, min: u32, max: u32) -> u32 {
    if min > max {
        return min;
    }
    preferred.clamp(min, max)
}

fn pick_rate_for_range(min: u32, max: u32, target_rate: Option<u32>) -> u32 {
    match target_rate {
        Some(target) => target.clamp(min, max.max(min)),
        None => max,
    }
}

fn sample_format_rank(format: cpal::SampleFormat) -> u8 {
    match format {
        cpal::SampleFormat::F32 => 0,
        cpal::SampleFormat::I32 => 1,
        cpal::SampleFormat::I16 => 2,
        cpal::SampleFormat::U16 => 3,
        _ => 10,
    }
}

/// Names of the output devices on `host`, in host order.
pub fn list_device_names(host: &cpal::Host) -> Result<Vec<String>> {
    let devices = host.output_devices().context("No output devices")?;
    let mut names = Vec::new();
    for d in devices {
        match d.description() {
            Ok(desc) => names.push(desc.name().to_string()),
            Err(e) => tracing::warn!("skipping device without description: {e}"),
        }
    }
    Ok(names)
}

/// Human-readable name of `device`.
pub fn device_name(device: &cpal::Device) -> Option<String> {
    device.description().ok().map(|d| d.name().to_string())
}

fn matches_device_name(name: &str, needle: &str) -> bool {
    let needle = needle.trim();
    if needle.is_empty() {
        return false;
    }
    name.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_buffer_frames_respects_device_range() {
        assert_eq!(clamp_buffer_frames(512, 64, 4096), 512);
        assert_eq!(clamp_buffer_frames(512, 1024, 4096), 1024);
        assert_eq!(clamp_buffer_frames(8192, 64, 4096), 4096);
        assert_eq!(clamp_buffer_frames(512, 2048, 1024), 2048);
    }

    #[test]
    fn matches_device_name_is_case_insensitive() {
        assert!(matches_device_name("USB DAC", "dac"));
        assert!(matches_device_name("usb dac", "USB"));
        assert!(!matches_device_name("USB DAC", "speaker"));
        assert!(!matches_device_name("USB DAC", ""));
    }

    #[test]
    fn pick_rate_for_range_prefers_target_when_in_range() {
        let rate = pick_rate_for_range(44_100, 96_000, Some(48_000));
        assert_eq!(rate, 48_000);
    }

    #[test]
    fn pick_rate_for_range_clamps_below_min() {
        let rate = pick_rate_for_range(44_100, 96_000, Some(22_050));
        assert_eq!(rate, 44_100);
    }

    #[test]
    fn pick_rate_for_range_clamps_above_max() {
        let rate = pick_rate_for_range(44_100, 96_000, Some(192_000));
        assert_eq!(rate, 96_000);
    }

    #[test]
    fn pick_rate_for_range_defaults_to_max() {
        let rate = pick_rate_for_range(44_100, 96_000, None);
        assert_eq!(rate, 96_000);
    }

    #[test]
    fn config_rank_prefers_rates_at_or_below_target() {
        let at = ConfigRank::new(48_000, Some(48_000), cpal::SampleFormat::I16);
        let above = ConfigRank::new(96_000, Some(48_000), cpal::SampleFormat::F32);
        assert!(at < above);
    }

    #[test]
    fn config_rank_prefers_higher_rate_then_float() {
        let low = ConfigRank::new(44_100, None, cpal::SampleFormat::F32);
        let high = ConfigRank::new(96_000, None, cpal::SampleFormat::I16);
        assert!(high < low);

        let int = ConfigRank::new(48_000, Some(48_000), cpal::SampleFormat::I32);
        let float = ConfigRank::new(48_000, Some(48_000), cpal::SampleFormat::F32);
        assert!(float < int);
    }
}
