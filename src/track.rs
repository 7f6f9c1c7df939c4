use crate::error::{Error, Result};
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::tag::Accessor;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// File extensions the player and the playlist pipeline accept.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "webm"];

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub path: PathBuf,
    pub title: String,
    pub artist: String,
    pub duration: Duration,
}

impl Track {
    /// Create a Track by reading metadata from an audio file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let tagged_file = lofty::read_from_path(path)
            .map_err(|e| Error::Audio(format!("Failed to read '{}': {}", path.display(), e)))?;

        let duration = tagged_file.properties().duration();
        let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());

        let title = tag
            .and_then(|t| t.title().map(|s| s.to_string()))
            .unwrap_or_else(|| file_stem(path));

        let artist = tag
            .and_then(|t| t.artist().map(|s| s.to_string()))
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(Track {
            path: path.to_path_buf(),
            title,
            artist,
            duration,
        })
    }

    /// A track whose tags could not be read: titled after the file, zero length.
    pub fn untagged(path: &Path) -> Self {
        Track {
            path: path.to_path_buf(),
            title: file_stem(path),
            artist: "Unknown".to_string(),
            duration: Duration::ZERO,
        }
    }

    /// Format duration as HH:MM:SS.
    pub fn duration_display(&self) -> String {
        format_hms(self.duration)
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// True when the file name ends in a supported audio extension.
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Supported audio files directly inside `dir` (not recursive), sorted by name.
pub fn list_audio_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && is_audio_file(p))
        .collect();
    files.sort();
    Ok(files)
}

/// Play length of one file. Unreadable files are logged and yield `None`.
pub fn audio_duration(path: &Path) -> Option<Duration> {
    match lofty::read_from_path(path) {
        Ok(file) => Some(file.properties().duration()),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Could not read audio length");
            None
        }
    }
}

/// Summed play length of every supported file in `dir`.
pub fn directory_duration(dir: &Path) -> Result<Duration> {
    Ok(list_audio_files(dir)?
        .iter()
        .filter_map(|p| audio_duration(p))
        .sum())
}
