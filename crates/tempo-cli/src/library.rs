//! Directory-backed media library.
//!
//! Scans a directory tree for supported audio files and reads title/artist tags with
//! Symphonia. Items are sorted by their `"<artist> - <title>"` label.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;

/// One playable entry; only `locator` is handed to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayableItem {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub locator: String,
}

impl PlayableItem {
    /// `"<artist> - <title>"`, with missing fields rendered empty.
    pub fn artist_with_title(&self) -> String {
        format!(
            "{} - {}",
            self.artist.as_deref().unwrap_or(""),
            self.title.as_deref().unwrap_or("")
        )
    }
}

/// Scan `root` recursively and return items sorted by label, then locator.
pub fn scan_items(root: &Path) -> Result<Vec<PlayableItem>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("canonicalize {:?}", root))?;
    let mut items = Vec::new();
    scan_dir(&root, &root, &mut items)?;
    sort_items(&mut items);
    tracing::info!(root = %root.display(), items = items.len(), "library scan complete");
    Ok(items)
}

/// Order by label, byte-wise (uppercase before lowercase), then by locator.
fn sort_items(items: &mut [PlayableItem]) {
    items.sort_by(|a, b| {
        a.artist_with_title()
            .cmp(&b.artist_with_title())
            .then_with(|| a.locator.cmp(&b.locator))
    });
}

fn scan_dir(root: &Path, dir: &Path, items: &mut Vec<PlayableItem>) -> Result<()> {
    let mut subdirs: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read_dir {:?}", dir))? {
        let entry = entry.context("read_dir entry")?;
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
            continue;
        }
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        if !is_supported_extension(&ext) {
            continue;
        }
        items.push(probe_item(&path, &ext));
    }

    for path in subdirs {
        let canon = path
            .canonicalize()
            .with_context(|| format!("canonicalize {:?}", path))?;
        // Symlinks pointing outside the root are skipped.
        if canon.starts_with(root) && canon != dir {
            scan_dir(root, &canon, items)?;
        }
    }
    Ok(())
}

fn is_supported_extension(ext: &str) -> bool {
    matches!(
        ext,
        "flac" | "wav" | "aiff" | "aif" | "mp3" | "m4a" | "aac" | "alac" | "ogg" | "oga"
    )
}

/// Build an item from tags, falling back to the file stem for the title.
fn probe_item(path: &Path, ext_hint: &str) -> PlayableItem {
    let (title, artist) = probe_tags(path, ext_hint);
    let title = title.or_else(|| {
        path.file_stem()
            .and_then(OsStr::to_str)
            .map(str::to_string)
    });
    PlayableItem {
        title,
        artist,
        locator: path.to_string_lossy().to_string(),
    }
}

fn probe_tags(path: &Path, ext_hint: &str) -> (Option<String>, Option<String>) {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return (None, None),
    };
    let mut hint = Hint::new();
    if !ext_hint.is_empty() {
        hint.with_extension(ext_hint);
    }
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut probed = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    ) {
        Ok(probed) => probed,
        Err(_) => return (None, None),
    };

    let mut title = None;
    let mut artist = None;
    let mut read_tags = |tags: &[symphonia::core::meta::Tag]| {
        for tag in tags {
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) if title.is_none() => {
                    title = non_empty(tag.value.to_string());
                }
                Some(StandardTagKey::Artist) if artist.is_none() => {
                    artist = non_empty(tag.value.to_string());
                }
                _ => {}
            }
        }
    };
    // Tags can live in the container or arrive with the probe (e.g. ID3v2 ahead of MP3).
    if let Some(rev) = probed.format.metadata().current() {
        read_tags(rev.tags());
    }
    if let Some(metadata) = probed.metadata.get() {
        if let Some(rev) = metadata.current() {
            read_tags(rev.tags());
        }
    }
    (title, artist)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tempo-cli-{tag}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn artist_with_title_renders_missing_fields_empty() {
        let item = PlayableItem {
            title: Some("Song".to_string()),
            artist: Some("Band".to_string()),
            locator: "/a".to_string(),
        };
        assert_eq!(item.artist_with_title(), "Band - Song");

        let bare = PlayableItem {
            title: None,
            artist: None,
            locator: "/b".to_string(),
        };
        assert_eq!(bare.artist_with_title(), " - ");
    }

    #[test]
    fn is_supported_extension_accepts_known() {
        assert!(is_supported_extension("flac"));
        assert!(is_supported_extension("m4a"));
        assert!(is_supported_extension("ogg"));
        assert!(!is_supported_extension("opus"));
        assert!(!is_supported_extension("txt"));
    }

    #[test]
    fn sort_items_compares_labels_case_sensitively() {
        let item = |artist: &str, title: &str, locator: &str| PlayableItem {
            title: Some(title.to_string()),
            artist: Some(artist.to_string()),
            locator: locator.to_string(),
        };
        let mut items = vec![
            item("alpha", "One", "/m/3.flac"),
            item("Zed", "Two", "/m/2.flac"),
            item("Zed", "Two", "/m/1.flac"),
            item("Bravo", "three", "/m/4.flac"),
        ];
        sort_items(&mut items);
        let locators: Vec<_> = items.iter().map(|i| i.locator.as_str()).collect();
        assert_eq!(locators, vec!["/m/4.flac", "/m/1.flac", "/m/2.flac", "/m/3.flac"]);
    }

    #[test]
    fn scan_items_filters_recurses_and_sorts() {
        let root = unique_temp_dir("library");
        let nested = root.join("Nested");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.join("zulu.flac"), b"test").unwrap();
        std::fs::write(nested.join("alpha.mp3"), b"test").unwrap();
        std::fs::write(root.join("cover.jpg"), b"test").unwrap();

        let items = scan_items(&root).unwrap();
        let titles: Vec<_> = items.iter().map(|i| i.title.clone().unwrap()).collect();
        assert_eq!(titles, vec!["alpha".to_string(), "zulu".to_string()]);
        assert!(items.iter().all(|i| i.artist.is_none()));
        assert!(items[0].locator.ends_with("alpha.mp3"));
        let _ = std::fs::remove_dir_all(root);
    }
}
