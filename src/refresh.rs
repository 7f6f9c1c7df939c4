//! Rebuilding the ordinary playlist: voted songs from the backend, screened
//! for airplay, topped up with unplayed songs from the local library.

use crate::backend::{BackendClient, Candidate};
use crate::downloader::{Downloader, extract_video_id};
use crate::gemini::{Classifier, Transcriber};
use crate::library::{self, Library, file_name};
use crate::player::PlaybackControl;
use crate::priority::{AuthorityView, PlaylistRefresh};
use crate::text_analysis::TextAnalyzer;
use crate::track::{audio_duration, format_hms};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where candidate songs come from.
pub trait SongSource: Send + Sync {
    fn fetch_candidates(&self) -> Option<Vec<Candidate>>;
}

impl SongSource for BackendClient {
    fn fetch_candidates(&self) -> Option<Vec<Candidate>> {
        BackendClient::fetch_candidates(self)
    }
}

/// Lyrics screening. Without it new downloads cannot be vetted and are
/// dropped; songs already in the library still play.
pub struct Screening {
    pub transcriber: Arc<dyn Transcriber>,
    pub classifier: Arc<dyn Classifier>,
    pub analyzer: TextAnalyzer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    /// Enqueued from the audio folder or after passing screening.
    Added(PathBuf),
    Blacklisted,
    AlreadyPlayed,
    /// Failed screening and was added to the blacklist.
    Rejected(String),
    Unscreened,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshReport {
    pub candidates: usize,
    pub added: usize,
    pub backend_duration: Duration,
    pub total_duration: Duration,
}

pub struct PlaylistRefresher {
    player: Arc<dyn PlaybackControl>,
    library: Arc<Library>,
    source: Arc<dyn SongSource>,
    downloader: Arc<dyn Downloader>,
    screening: Option<Screening>,
    temp_dir: PathBuf,
    refresh_target: Duration,
    local_target: Duration,
    authority: AuthorityView,
    running: Mutex<()>,
}

impl PlaylistRefresher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        player: Arc<dyn PlaybackControl>,
        library: Arc<Library>,
        source: Arc<dyn SongSource>,
        downloader: Arc<dyn Downloader>,
        screening: Option<Screening>,
        temp_dir: impl Into<PathBuf>,
        refresh_target: Duration,
        local_target: Duration,
    ) -> Self {
        if screening.is_none() {
            warn!("No lyrics screening configured; only library songs will be queued");
        }
        Self {
            player,
            library,
            source,
            downloader,
            screening,
            temp_dir: temp_dir.into(),
            refresh_target,
            local_target,
            authority: AuthorityView::idle(),
            running: Mutex::new(()),
        }
    }

    /// Back off whenever a priority playlist holds the device in `authority`.
    pub fn yield_to(mut self, authority: AuthorityView) -> Self {
        self.authority = authority;
        self
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    /// Full refresh. Returns `None` if another refresh is in progress or a
    /// priority playlist holds the device. A takeover during the refresh
    /// stops it from queueing anything more.
    pub fn run_refresh(&self) -> Option<RefreshReport> {
        let _running = self.try_begin()?;
        info!("Refreshing playlist");
        self.prepare_player()?;
        library::clear_dir_files(&self.temp_dir);

        let mut report = RefreshReport::default();
        let candidates = self.source.fetch_candidates().unwrap_or_else(|| {
            warn!("No songs from backend; using local library only");
            Vec::new()
        });
        report.candidates = candidates.len();

        for candidate in &candidates {
            if self.authority.is_priority_playing() {
                info!("Priority playlist took over; leaving remaining candidates");
                break;
            }
            match self.process(&candidate.url) {
                CandidateOutcome::Added(path) => {
                    report.added += 1;
                    report.backend_duration += audio_duration(&path).unwrap_or_default();
                }
                other => debug!(url = %candidate.url, outcome = ?other, "Candidate not queued"),
            }
        }
        info!(duration = %format_hms(report.backend_duration), "Backend songs processed");

        report.total_duration = self.top_up(report.backend_duration, self.refresh_target, &mut report.added);
        info!(
            duration = %format_hms(report.total_duration),
            songs = report.added,
            "Playlist refreshed"
        );
        Some(report)
    }

    /// Local-only refresh from unplayed library songs.
    pub fn refresh_local(&self) -> Option<RefreshReport> {
        let _running = self.try_begin()?;
        info!("Refreshing playlist from local library");
        self.prepare_player()?;
        let mut report = RefreshReport::default();
        report.total_duration = self.top_up(Duration::ZERO, self.local_target, &mut report.added);
        info!(duration = %format_hms(report.total_duration), "Local playlist refreshed");
        Some(report)
    }

    fn try_begin(&self) -> Option<std::sync::MutexGuard<'_, ()>> {
        match self.running.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => {
                warn!("Playlist refresh already running; skipping");
                None
            }
        }
    }

    /// Player work that must not land on top of a priority playlist.
    fn on_player<T>(&self, action: &str, f: impl FnOnce() -> T) -> Option<T> {
        let out = self.authority.unless_priority(f);
        if out.is_none() {
            info!(action, "Priority playlist holds the device; refresh backs off");
        }
        out
    }

    fn prepare_player(&self) -> Option<()> {
        let prepared = self.on_player("prepare", || self.player.prepare_for_update())?;
        if let Err(e) = prepared {
            error!(error = %e, "Could not prepare player for update");
        }
        Some(())
    }

    /// Enqueue random unplayed songs until `current` reaches `target`.
    fn top_up(&self, mut current: Duration, target: Duration, added: &mut usize) -> Duration {
        while current < target {
            if self.authority.is_priority_playing() {
                break;
            }
            let Some(path) = self.library.take_random_unplayed() else {
                warn!("No more songs available to add");
                break;
            };
            let Some(length) = audio_duration(&path) else {
                continue;
            };
            if self.enqueue(&path) {
                current += length;
                *added += 1;
                debug!(song = %file_name(&path), total = %format_hms(current), "Added local song");
            }
        }
        current
    }

    fn enqueue(&self, path: &Path) -> bool {
        match self.on_player("enqueue", || self.player.enqueue(path)) {
            None => false,
            Some(Ok(())) => true,
            Some(Err(e)) => {
                error!(file = %path.display(), error = %e, "Could not enqueue song");
                false
            }
        }
    }

    /// Run one candidate through the pipeline.
    pub fn process(&self, url: &str) -> CandidateOutcome {
        let Some(video_id) = extract_video_id(url) else {
            warn!(url, "Not a YouTube video URL");
            return CandidateOutcome::Failed("unrecognised URL".into());
        };
        if self.library.is_blacklisted(&video_id) {
            info!(video_id, "Blacklisted; skipping download");
            return CandidateOutcome::Blacklisted;
        }

        let fetched = match self.downloader.fetch(url) {
            Ok(f) => f,
            Err(e) => {
                error!(url, error = %e, "Download failed");
                return CandidateOutcome::Failed(e.to_string());
            }
        };
        let name = file_name(&fetched.path);
        // Files from the audio folder itself are never deleted.
        let discard = |path: &Path| {
            if !fetched.cached {
                remove_file(path);
            }
        };

        if self.library.is_played(&name) {
            info!(song = %name, "Already played");
            discard(&fetched.path);
            return CandidateOutcome::AlreadyPlayed;
        }

        if self.library.contains_audio(&name) {
            info!(song = %name, "Already in audio folder");
            discard(&fetched.path);
            let existing = self.library.audio_dir().join(&name);
            return self.queue_and_record(existing, &name);
        }

        let Some(screening) = &self.screening else {
            warn!(song = %name, "Cannot screen new download");
            discard(&fetched.path);
            return CandidateOutcome::Unscreened;
        };

        let Some(lyrics) = screening.transcriber.transcribe(&fetched.path) else {
            return self.reject(&name, &fetched.path, "no lyrics".into());
        };

        let analysis = screening.analyzer.analyze(&lyrics);
        if !analysis.is_acceptable() {
            return self.reject(&name, &fetched.path, format!("profanity: {:?}", analysis.verdict));
        }

        match screening.classifier.classify(&analysis.text_clean) {
            None => self.reject(&name, &fetched.path, "no sentiment result".into()),
            Some(v) if !v.is_safe_for_radio => self.reject(&name, &fetched.path, v.explanation),
            Some(_) => self.accept(&name, &fetched.path),
        }
    }

    fn reject(&self, name: &str, temp_path: &Path, reason: String) -> CandidateOutcome {
        info!(song = name, %reason, "Song rejected");
        self.library.blacklist(name);
        remove_file(temp_path);
        CandidateOutcome::Rejected(reason)
    }

    fn accept(&self, name: &str, temp_path: &Path) -> CandidateOutcome {
        let final_path = self.library.audio_dir().join(name);
        if let Err(e) = move_file(temp_path, &final_path) {
            error!(song = name, error = %e, "Could not move song to audio folder");
            remove_file(temp_path);
            return CandidateOutcome::Failed(e.to_string());
        }
        info!(song = name, "Song accepted");
        self.queue_and_record(final_path, name)
    }

    fn queue_and_record(&self, path: PathBuf, name: &str) -> CandidateOutcome {
        if !self.enqueue(&path) {
            return CandidateOutcome::Failed("enqueue failed".into());
        }
        self.library.mark_played(name);
        CandidateOutcome::Added(path)
    }
}

impl PlaylistRefresh for PlaylistRefresher {
    fn refresh(&self) {
        self.run_refresh();
    }
}

fn remove_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %path.display(), error = %e, "Could not remove file");
        }
    }
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}
