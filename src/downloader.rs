//! Fetching songs and playlists from YouTube through the `yt-dlp` executable.

use crate::error::{Error, Result};
use crate::track::{is_audio_file, list_audio_files};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};
use url::Url;

/// A fetched song and whether it came from the screened audio folder.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub path: PathBuf,
    pub cached: bool,
}

pub trait Downloader: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Fetched>;

    /// Download every entry of a playlist into `dest`. Returns the number of
    /// audio files in `dest` afterwards.
    fn fetch_playlist(&self, url: &str, dest: &Path) -> Result<usize>;
}

/// Video id of a YouTube URL: `watch?v=`, `youtu.be/`, `shorts/` or `embed/`.
pub fn extract_video_id(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let id = match host {
        "youtu.be" => segments.next().map(str::to_string),
        "youtube.com" | "music.youtube.com" | "youtube-nocookie.com" => {
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some("shorts") | Some("embed") | Some("live") => {
                    segments.next().map(str::to_string)
                }
                _ => None,
            }
        }
        _ => None,
    }?;
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(id)
}

/// First audio file in `dir` whose name contains `video_id`.
pub fn find_cached(dir: &Path, video_id: &str) -> Option<PathBuf> {
    list_audio_files(dir)
        .ok()?
        .into_iter()
        .find(|p| p.file_name().is_some_and(|n| n.to_string_lossy().contains(video_id)))
}

pub struct YtDlp {
    program: String,
    temp_dir: PathBuf,
    cache_dir: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<String>, temp_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            temp_dir: temp_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<()> {
        debug!(program = %self.program, ?args, "Running downloader");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| Error::Download(format!("failed to launch {}: {}", self.program, e)))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Download(format!(
                "{} exited with status {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stderr.lines().last().unwrap_or_default()
            )))
        }
    }
}

/// Arguments for one song, saved as `<dir>/<video id>.<ext>`.
pub fn song_args(url: &str, dir: &Path) -> Vec<String> {
    vec![
        "--no-playlist".into(),
        "--quiet".into(),
        "-f".into(),
        "bestaudio[ext=webm]/bestaudio[ext=mp3]/bestaudio".into(),
        "-o".into(),
        dir.join("%(id)s.%(ext)s").to_string_lossy().to_string(),
        url.into(),
    ]
}

/// Arguments for a whole playlist, converted to mp3 and named by title.
pub fn playlist_args(url: &str, dest: &Path) -> Vec<String> {
    vec![
        "--yes-playlist".into(),
        "--quiet".into(),
        "--ignore-errors".into(),
        "-x".into(),
        "--audio-format".into(),
        "mp3".into(),
        "-o".into(),
        dest.join("%(title)s.%(ext)s").to_string_lossy().to_string(),
        url.into(),
    ]
}

impl Downloader for YtDlp {
    fn fetch(&self, url: &str) -> Result<Fetched> {
        let video_id = extract_video_id(url)
            .ok_or_else(|| Error::InvalidInput(format!("not a YouTube video URL: {}", url)))?;

        if let Some(path) = find_cached(&self.cache_dir, &video_id) {
            info!(file = %path.display(), "Found cached file");
            return Ok(Fetched { path, cached: true });
        }

        fs::create_dir_all(&self.temp_dir)?;
        info!(url, dir = %self.temp_dir.display(), "Downloading");
        self.run(&song_args(url, &self.temp_dir))?;

        let path = fs::read_dir(&self.temp_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| {
                is_audio_file(p)
                    && p.file_stem().is_some_and(|s| s.to_string_lossy() == video_id)
            })
            .ok_or_else(|| Error::Download(format!("no audio file produced for {}", video_id)))?;
        Ok(Fetched { path, cached: false })
    }

    fn fetch_playlist(&self, url: &str, dest: &Path) -> Result<usize> {
        Url::parse(url).map_err(|e| Error::InvalidInput(format!("invalid playlist URL: {}", e)))?;
        fs::create_dir_all(dest)?;
        info!(url, dest = %dest.display(), "Downloading playlist");
        if let Err(e) = self.run(&playlist_args(url, dest)) {
            // --ignore-errors still exits non-zero when single entries fail
            warn!(error = %e, "Playlist download reported errors");
        }
        let count = list_audio_files(dest)?.len();
        if count == 0 {
            return Err(Error::Download(format!("no audio downloaded from {}", url)));
        }
        Ok(count)
    }
}
