//! Scratch area for per-session transcoded files.
//!
//! At most one playable file exists at a time, always under the same name. Exports
//! write to a `.partial` sibling and are renamed into place only when complete, so a
//! failed or cancelled export never leaves a truncated playable file behind.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::ExportFormat;

const FILE_STEM: &str = "playback";
const PARTIAL_SUFFIX: &str = ".partial";

pub struct ScratchArea {
    dir: PathBuf,
    playable: PathBuf,
    partial: PathBuf,
}

impl ScratchArea {
    /// Create (or reuse) `dir` and remove leftovers from earlier runs.
    pub fn new(dir: PathBuf, extension: &str) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let removed = remove_owned_files(&dir)?;
        if removed > 0 {
            tracing::info!(removed, dir = %dir.display(), "removed stale scratch files");
        }
        let playable = dir.join(format!("{FILE_STEM}.{extension}"));
        let partial = dir.join(format!("{FILE_STEM}.{extension}{PARTIAL_SUFFIX}"));
        Ok(Self {
            dir,
            playable,
            partial,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path the player reads from.
    pub fn playable_path(&self) -> &Path {
        &self.playable
    }

    /// Path exporters write to.
    pub fn partial_path(&self) -> &Path {
        &self.partial
    }

    /// Remove any half-written export. Missing files are fine.
    pub fn discard_partial(&self) -> io::Result<()> {
        remove_if_exists(&self.partial)
    }

    /// Move a finished export into place, replacing the previous playable file.
    pub fn commit(&self) -> io::Result<&Path> {
        std::fs::rename(&self.partial, &self.playable)?;
        Ok(&self.playable)
    }

    /// Delete the playable file and any partial export.
    pub fn clear(&self) -> io::Result<()> {
        remove_if_exists(&self.partial)?;
        remove_if_exists(&self.playable)
    }

    /// Delete the scratch directory if nothing else lives in it.
    pub fn remove(&self) {
        if let Err(e) = self.clear() {
            tracing::warn!("scratch cleanup failed: {e}");
        }
        // Fails harmlessly when the directory is shared with other files.
        let _ = std::fs::remove_dir(&self.dir);
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Names a scratch area can create, for every export format.
fn owned_file_names() -> impl Iterator<Item = String> {
    [ExportFormat::Aac, ExportFormat::Wav]
        .into_iter()
        .flat_map(|format| {
            let playable = format!("{FILE_STEM}.{}", format.extension());
            let partial = format!("{playable}{PARTIAL_SUFFIX}");
            [playable, partial]
        })
}

/// Remove the files a scratch area may have left in `dir`. Other files are untouched.
fn remove_owned_files(dir: &Path) -> io::Result<usize> {
    let mut removed = 0usize;
    for name in owned_file_names() {
        match std::fs::remove_file(dir.join(&name)) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// Remove scratch files from `dir`, then `dir` itself if nothing else lives there.
///
/// For exit paths that have no [`ScratchArea`] at hand, such as a signal handler.
pub fn remove_scratch_files(dir: &Path) {
    if let Err(e) = remove_owned_files(dir) {
        tracing::warn!(dir = %dir.display(), "scratch cleanup failed: {e}");
    }
    let _ = std::fs::remove_dir(dir);
}
