//! Local music library and its flat-file bookkeeping: the played list, the
//! blacklist, the screened audio folder and the special playlists folder.

use crate::error::{Error, Result};
use crate::track::{self, list_audio_files};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Append-only list of names, one per line.
pub struct LineFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl LineFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-empty trimmed lines. Read failures are logged and yield nothing.
    pub fn entries(&self) -> Vec<String> {
        match fs::read_to_string(&self.path) {
            Ok(text) => text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(file = %self.path.display(), error = %e, "Could not read list file");
                Vec::new()
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries().iter().any(|e| e == name)
    }

    pub fn append(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", name)?;
        Ok(())
    }

    /// Empty the file, creating it if needed.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, "")?;
        Ok(())
    }
}

pub struct Library {
    audio_dir: PathBuf,
    special_dir: PathBuf,
    played: LineFile,
    blacklist: LineFile,
}

impl Library {
    pub fn new(
        audio_dir: impl Into<PathBuf>,
        special_dir: impl Into<PathBuf>,
        played_file: impl Into<PathBuf>,
        blacklist_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            audio_dir: audio_dir.into(),
            special_dir: special_dir.into(),
            played: LineFile::new(played_file),
            blacklist: LineFile::new(blacklist_file),
        }
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    pub fn special_dir(&self) -> &Path {
        &self.special_dir
    }

    /// Create the audio and special playlist folders if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.audio_dir)?;
        fs::create_dir_all(&self.special_dir)?;
        Ok(())
    }

    // ── Played list ──────────────────────────────────────────────────────────

    pub fn played(&self) -> Vec<String> {
        self.played.entries()
    }

    pub fn is_played(&self, name: &str) -> bool {
        self.played.contains(name)
    }

    /// Record a track as played. Failures are logged, never raised.
    pub fn mark_played(&self, name: &str) {
        match self.played.append(name) {
            Ok(()) => debug!(name, "Marked as played"),
            Err(e) => warn!(name, error = %e, "Could not record played song"),
        }
    }

    pub fn clear_played(&self) -> Result<()> {
        self.played.clear()?;
        info!("Played songs list cleared");
        Ok(())
    }

    // ── Blacklist ────────────────────────────────────────────────────────────

    pub fn blacklisted(&self) -> Vec<String> {
        self.blacklist.entries()
    }

    /// True if any blacklist entry contains `video_id`.
    pub fn is_blacklisted(&self, video_id: &str) -> bool {
        !video_id.is_empty() && self.blacklisted().iter().any(|e| e.contains(video_id))
    }

    /// Add a track name to the blacklist unless it is already there.
    pub fn blacklist(&self, name: &str) {
        if self.blacklist.contains(name) {
            debug!(name, "Already blacklisted");
            return;
        }
        match self.blacklist.append(name) {
            Ok(()) => info!(name, "Added to blacklist"),
            Err(e) => warn!(name, error = %e, "Could not add to blacklist"),
        }
    }

    // ── Audio folder ─────────────────────────────────────────────────────────

    pub fn contains_audio(&self, name: &str) -> bool {
        self.audio_dir.join(name).is_file()
    }

    /// Screened songs not yet played today.
    pub fn unplayed(&self) -> Vec<PathBuf> {
        let played: HashSet<String> = self.played().into_iter().collect();
        match list_audio_files(&self.audio_dir) {
            Ok(files) => files
                .into_iter()
                .filter(|p| !played.contains(&file_name(p)))
                .collect(),
            Err(e) => {
                warn!(dir = %self.audio_dir.display(), error = %e, "Could not list audio folder");
                Vec::new()
            }
        }
    }

    /// Pick a random unplayed song and record it as played.
    pub fn take_random_unplayed(&self) -> Option<PathBuf> {
        let candidates = self.unplayed();
        if candidates.is_empty() {
            warn!("No unplayed songs available");
            return None;
        }
        let pick = candidates[fastrand::usize(..candidates.len())].clone();
        self.mark_played(&file_name(&pick));
        Some(pick)
    }

    // ── Special playlists ────────────────────────────────────────────────────

    /// Names of the sub-directories of the special playlists folder.
    pub fn list_playlists(&self) -> Result<Vec<String>> {
        if !self.special_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = fs::read_dir(&self.special_dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Audio file names inside one special playlist.
    pub fn list_songs(&self, playlist: &str) -> Result<Vec<String>> {
        let dir = self.playlist_dir(playlist)?;
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("Playlist {} does not exist", playlist)));
        }
        Ok(list_audio_files(&dir)?.iter().map(|p| file_name(p)).collect())
    }

    /// Folder for a playlist name after sanitizing.
    pub fn playlist_dir(&self, playlist: &str) -> Result<PathBuf> {
        let clean = sanitize_name(playlist);
        if clean.is_empty() {
            return Err(Error::InvalidInput(format!("Invalid playlist name '{}'", playlist)));
        }
        Ok(self.special_dir.join(clean))
    }

    /// Remove the audio files of a playlist folder, keeping the folder.
    pub fn empty_playlist(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Ok(0);
        }
        let files = list_audio_files(dir)?;
        for f in &files {
            fs::remove_file(f)?;
        }
        Ok(files.len())
    }
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Make a user-supplied name safe as a single directory name: drop path
/// separators and characters Windows forbids, control characters, and
/// surrounding dots and spaces.
pub fn sanitize_name(name: &str) -> String {
    const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && !FORBIDDEN.contains(c))
        .collect();
    cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string()
}

/// Delete every file (not directory) in `dir`. Failures are logged.
pub fn clear_dir_files(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Could not list folder for cleanup");
            return;
        }
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_file() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "Could not remove file");
            }
        }
    }
}

/// Whether `path` names a file the player can take.
pub fn is_playable(path: &Path) -> bool {
    path.is_file() && track::is_audio_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn library() -> (TempDir, Library) {
        let dir = tempdir().unwrap();
        let lib = Library::new(
            dir.path().join("audio"),
            dir.path().join("special_playlists"),
            dir.path().join("played_songs.txt"),
            dir.path().join("blacklisted_songs.txt"),
        );
        lib.ensure_dirs().unwrap();
        (dir, lib)
    }

    #[test]
    fn played_list_appends_and_clears() {
        let (_d, lib) = library();
        assert!(lib.played().is_empty());
        lib.mark_played("a.webm");
        lib.mark_played("b.webm");
        assert!(lib.is_played("a.webm"));
        assert_eq!(lib.played(), vec!["a.webm", "b.webm"]);
        lib.clear_played().unwrap();
        assert!(lib.played().is_empty());
    }

    #[test]
    fn blacklist_deduplicates_and_matches_by_substring() {
        let (_d, lib) = library();
        lib.blacklist("dQw4w9WgXcQ.webm");
        lib.blacklist("dQw4w9WgXcQ.webm");
        assert_eq!(lib.blacklisted().len(), 1);
        assert!(lib.is_blacklisted("dQw4w9WgXcQ"));
        assert!(!lib.is_blacklisted("other"));
        assert!(!lib.is_blacklisted(""));
    }

    #[test]
    fn random_unplayed_exhausts_then_stops() {
        let (_d, lib) = library();
        for name in ["a.mp3", "b.mp3"] {
            fs::write(lib.audio_dir().join(name), "x").unwrap();
        }
        fs::write(lib.audio_dir().join("readme.txt"), "x").unwrap();

        let first = lib.take_random_unplayed().unwrap();
        let second = lib.take_random_unplayed().unwrap();
        assert_ne!(first, second);
        assert!(lib.take_random_unplayed().is_none());
        assert_eq!(lib.played().len(), 2);
    }

    #[test]
    fn sanitize_strips_unsafe_characters() {
        assert_eq!(sanitize_name("Morning: Show?"), "Morning Show");
        assert_eq!(sanitize_name("../../etc"), "etc");
        assert_eq!(sanitize_name("  .hidden. "), "hidden");
        assert_eq!(sanitize_name("a/b\\c"), "abc");
        assert_eq!(sanitize_name("..."), "");
    }

    #[test]
    fn playlists_and_songs_are_listed() {
        let (_d, lib) = library();
        let dir = lib.playlist_dir("Assembly").unwrap();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("anthem.mp3"), "x").unwrap();
        fs::write(dir.join("notes.txt"), "x").unwrap();
        fs::create_dir_all(lib.special_dir().join("Empty")).unwrap();

        assert_eq!(lib.list_playlists().unwrap(), vec!["Assembly", "Empty"]);
        assert_eq!(lib.list_songs("Assembly").unwrap(), vec!["anthem.mp3"]);
        assert!(matches!(lib.list_songs("Missing"), Err(Error::NotFound(_))));
        assert!(matches!(lib.playlist_dir("///"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn empty_playlist_keeps_folder() {
        let (_d, lib) = library();
        let dir = lib.playlist_dir("Mix").unwrap();
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("a.mp3"), "x").unwrap();
        fs::write(dir.join("cover.jpg"), "x").unwrap();
        assert_eq!(lib.empty_playlist(&dir).unwrap(), 1);
        assert!(dir.join("cover.jpg").exists());
    }

    #[test]
    fn clear_dir_files_leaves_subdirectories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.part"), "x").unwrap();
        fs::create_dir(dir.path().join("keep")).unwrap();
        clear_dir_files(dir.path());
        assert!(!dir.path().join("a.part").exists());
        assert!(dir.path().join("keep").exists());
        clear_dir_files(&dir.path().join("missing"));
    }
}
