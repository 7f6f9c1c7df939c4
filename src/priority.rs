//! Priority playlists: one-off takeovers of the playback device by a
//! directory of local tracks at a chosen date and time.
//!
//! A task is pending from `add` until cleanup. When its trigger fires on the
//! right date, and no other takeover is loaded, the orchestrator takes
//! playback authority, loads the directory and starts a monitor job that
//! ends the takeover once the summed track length has elapsed. Cleanup
//! releases authority, refreshes the ordinary playlist and resumes playback.
//!
//! All takeover state sits behind one mutex owned by the orchestrator. Other
//! components read it through `AuthorityView`.

use crate::error::{Error, Result};
use crate::player::{self, PlaybackControl};
use crate::scheduler::{JobHandle, JobOutcome, Scheduler};
use crate::timefmt;
use crate::track;
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The ordinary playlist refresh that takes over again after a priority
/// playlist ends.
pub trait PlaylistRefresh: Send + Sync {
    fn refresh(&self);
}

/// Who holds the playback device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authority {
    pub is_priority_playing: bool,
    pub current_task: Option<String>,
    pub end_time: Option<NaiveDateTime>,
    /// Single-flight lock: set while a takeover is loaded.
    pub is_loaded: bool,
}

#[derive(Debug, Clone)]
struct PriorityTask {
    directory: String,
    full_path: PathBuf,
    play_datetime: NaiveDateTime,
    playlist_name: String,
    duration: Duration,
    trigger: Option<JobHandle>,
}

/// Read-only view of a pending task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTask {
    pub task_id: String,
    pub directory: String,
    /// `YYYY-MM-DD HH:MM`
    pub play_datetime: String,
    pub playlist_name: String,
}

#[derive(Debug, Default)]
struct State {
    authority: Authority,
    tasks: BTreeMap<String, PriorityTask>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    // Every transition leaves the state consistent before releasing the lock.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Read access to playback authority for components that must defer to a
/// running priority playlist.
#[derive(Clone)]
pub struct AuthorityView {
    state: Arc<Mutex<State>>,
}

impl AuthorityView {
    /// Fresh authority with no takeover in progress. Hand it to
    /// `PriorityOrchestrator::with_authority` to share it with components
    /// built before the orchestrator.
    pub fn idle() -> Self {
        AuthorityView {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn is_priority_playing(&self) -> bool {
        lock(&self.state).authority.is_priority_playing
    }

    pub fn snapshot(&self) -> Authority {
        lock(&self.state).authority.clone()
    }

    /// Run `f` unless a priority playlist holds the device. Authority cannot
    /// change hands while `f` runs, so `f` must not read it again.
    pub fn unless_priority<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let state = lock(&self.state);
        if state.authority.is_priority_playing {
            return None;
        }
        let out = f();
        drop(state);
        Some(out)
    }
}

pub struct PriorityOrchestrator {
    state: Arc<Mutex<State>>,
    scheduler: Arc<Scheduler>,
    player: Arc<dyn PlaybackControl>,
    refresh: Arc<dyn PlaylistRefresh>,
    base_dir: PathBuf,
    monitor_period: TimeDelta,
    me: Weak<PriorityOrchestrator>,
}

impl PriorityOrchestrator {
    /// `base_dir` anchors the relative directories passed to `add`.
    pub fn new(
        scheduler: Arc<Scheduler>,
        player: Arc<dyn PlaybackControl>,
        refresh: Arc<dyn PlaylistRefresh>,
        base_dir: impl Into<PathBuf>,
        monitor_period: TimeDelta,
    ) -> Arc<Self> {
        Self::with_authority(
            AuthorityView::idle(),
            scheduler,
            player,
            refresh,
            base_dir,
            monitor_period,
        )
    }

    /// Like `new`, but keeps its state in `authority`.
    pub fn with_authority(
        authority: AuthorityView,
        scheduler: Arc<Scheduler>,
        player: Arc<dyn PlaybackControl>,
        refresh: Arc<dyn PlaylistRefresh>,
        base_dir: impl Into<PathBuf>,
        monitor_period: TimeDelta,
    ) -> Arc<Self> {
        let base_dir = base_dir.into();
        Arc::new_cyclic(|me| PriorityOrchestrator {
            state: authority.state,
            scheduler,
            player,
            refresh,
            base_dir,
            monitor_period,
            me: me.clone(),
        })
    }

    pub fn view(&self) -> AuthorityView {
        AuthorityView {
            state: Arc::clone(&self.state),
        }
    }

    pub fn authority(&self) -> Authority {
        self.view().snapshot()
    }

    fn now(&self) -> NaiveDateTime {
        self.scheduler.clock().now()
    }

    /// Plan a priority playlist. `directory` is relative to the base
    /// directory; `play_date` is `YYYY-MM-DD` and `play_time` is `HH:MM`.
    pub fn add(&self, directory: &str, play_date: &str, play_time: &str) -> Result<String> {
        self.try_add(directory, play_date, play_time)
            .inspect_err(|e| error!(directory, play_date, play_time, error = %e, "Could not plan priority playlist"))
    }

    fn try_add(&self, directory: &str, play_date: &str, play_time: &str) -> Result<String> {
        let date = timefmt::parse_date(play_date)?;
        let time = timefmt::parse_time(play_time)?;
        let play_datetime = date.and_time(time);

        if play_datetime <= self.now() {
            return Err(Error::InvalidInput(
                "Date and time must be in the future".to_string(),
            ));
        }

        let task_id = format!(
            "priority_{}_{}_{}",
            directory,
            timefmt::format_date(date),
            timefmt::format_time(time)
        );
        self.ensure_unique(&task_id)?;

        let full_path = self.resolve_directory(directory)?;
        let files = track::list_audio_files(&full_path)?;
        if files.is_empty() {
            return Err(Error::InvalidInput(format!(
                "No audio files in directory {}",
                directory
            )));
        }
        let duration: Duration = files.iter().filter_map(|f| track::audio_duration(f)).sum();
        let playlist_name = format!(
            "priority_{}",
            full_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| directory.to_string())
        );

        let trigger = {
            let me = self.me.clone();
            let id = task_id.clone();
            self.scheduler.register_daily(time, move || match me.upgrade() {
                Some(orch) => orch.on_trigger(&id, date),
                None => JobOutcome::Cancel,
            })
        };

        let mut state = lock(&self.state);
        if state.tasks.contains_key(&task_id) {
            drop(state);
            self.scheduler.cancel(trigger);
            return Err(duplicate(&task_id));
        }
        state.tasks.insert(
            task_id.clone(),
            PriorityTask {
                directory: directory.to_string(),
                full_path,
                play_datetime,
                playlist_name: playlist_name.clone(),
                duration,
                trigger: Some(trigger),
            },
        );
        drop(state);

        info!(
            task_id = %task_id,
            playlist = %playlist_name,
            at = %timefmt::format_datetime(play_datetime),
            duration_secs = duration.as_secs(),
            "Priority playlist planned"
        );
        Ok(task_id)
    }

    fn ensure_unique(&self, task_id: &str) -> Result<()> {
        if lock(&self.state).tasks.contains_key(task_id) {
            return Err(duplicate(task_id));
        }
        Ok(())
    }

    /// Relative path under the base directory; no escaping upward.
    fn resolve_directory(&self, directory: &str) -> Result<PathBuf> {
        let rel = Path::new(directory);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if directory.trim().is_empty() || escapes {
            return Err(Error::InvalidInput(format!(
                "Directory must be a relative path: {}",
                directory
            )));
        }
        let full = self.base_dir.join(rel);
        if !full.is_dir() {
            return Err(Error::NotFound(format!("Directory {} does not exist", directory)));
        }
        Ok(full)
    }

    /// Daily trigger body: only the planned date activates.
    fn on_trigger(&self, task_id: &str, date: NaiveDate) -> JobOutcome {
        if self.now().date() != date {
            debug!(task_id, "Priority trigger fired on another day; waiting");
            return JobOutcome::Continue;
        }
        if let Err(e) = self.activate(task_id) {
            error!(task_id, error = %e, "Priority playlist activation failed");
        }
        JobOutcome::Continue
    }

    /// Take playback authority for `task_id` and load its tracks. Returns
    /// `Ok(false)` when another takeover is already loaded or the task is gone.
    pub fn activate(&self, task_id: &str) -> Result<bool> {
        let (dir, playlist_name, end_time) = {
            let mut state = lock(&self.state);
            if state.authority.is_loaded {
                debug!(task_id, current = ?state.authority.current_task, "A priority playlist is already loaded");
                return Ok(false);
            }
            let Some(task) = state.tasks.get(task_id) else {
                warn!(task_id, "Priority task no longer exists");
                return Ok(false);
            };
            let (dir, name) = (task.full_path.clone(), task.playlist_name.clone());
            let duration = TimeDelta::from_std(task.duration)
                .map_err(|e| Error::Internal(format!("duration out of range: {}", e)))?;
            let end_time = self.now() + duration;
            state.authority = Authority {
                is_priority_playing: true,
                current_task: Some(task_id.to_string()),
                end_time: Some(end_time),
                is_loaded: true,
            };
            (dir, name, end_time)
        };

        // The monitor goes in before any device work so a failed load still
        // ends the takeover on time.
        let me = self.me.clone();
        let id = task_id.to_string();
        self.scheduler.register_interval(self.monitor_period, move || match me.upgrade() {
            Some(orch) => orch.on_monitor(&id),
            None => JobOutcome::Cancel,
        });

        info!(task_id, playlist = %playlist_name, until = %end_time, "Priority playlist taking over");
        self.player.prepare_for_update()?;
        let count = player::enqueue_directory(self.player.as_ref(), &dir)?;
        self.player.play()?;
        self.player.start_output()?;
        info!(task_id, tracks = count, "Priority playlist loaded");
        Ok(true)
    }

    fn on_monitor(&self, task_id: &str) -> JobOutcome {
        let finished = {
            let state = lock(&self.state);
            let auth = &state.authority;
            if !auth.is_priority_playing || auth.current_task.as_deref() != Some(task_id) {
                debug!(task_id, "Monitor superseded");
                return JobOutcome::Cancel;
            }
            auth.end_time.is_some_and(|end| self.now() >= end)
        };

        if finished {
            info!(task_id, "Priority playlist finished");
            self.cleanup(task_id);
            JobOutcome::Cancel
        } else {
            JobOutcome::Continue
        }
    }

    /// End a task: cancel its trigger and forget it. If it held playback
    /// authority, release it, refresh the ordinary playlist and resume
    /// audible playback. Returns false when the task was already gone.
    pub fn cleanup(&self, task_id: &str) -> bool {
        let (task, was_active) = {
            let mut state = lock(&self.state);
            let Some(task) = state.tasks.remove(task_id) else {
                debug!(task_id, "Cleanup for unknown task ignored");
                return false;
            };
            let was_active = state.authority.current_task.as_deref() == Some(task_id);
            if was_active {
                state.authority = Authority::default();
            }
            (task, was_active)
        };

        if let Some(trigger) = task.trigger {
            self.scheduler.cancel(trigger);
        }
        info!(task_id, was_active, "Priority task removed");

        if was_active {
            self.refresh.refresh();
            let resumed = self.player.play().and_then(|()| self.player.start_output());
            if let Err(e) = resumed {
                error!(error = %e, "Could not resume playback after priority playlist");
            }
        }
        true
    }

    /// Pending tasks ordered by play time.
    pub fn get_pending(&self) -> Vec<PendingTask> {
        let state = lock(&self.state);
        let mut tasks: Vec<(NaiveDateTime, PendingTask)> = state
            .tasks
            .iter()
            .map(|(id, t)| {
                (
                    t.play_datetime,
                    PendingTask {
                        task_id: id.clone(),
                        directory: t.directory.clone(),
                        play_datetime: timefmt::format_datetime(t.play_datetime),
                        playlist_name: t.playlist_name.clone(),
                    },
                )
            })
            .collect();
        tasks.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.task_id.cmp(&b.1.task_id)));
        tasks.into_iter().map(|(_, t)| t).collect()
    }

    /// Summed track length of a pending task.
    #[cfg(test)]
    fn task_duration(&self, task_id: &str) -> Option<Duration> {
        lock(&self.state).tasks.get(task_id).map(|t| t.duration)
    }
}

fn duplicate(task_id: &str) -> Error {
    Error::AlreadyExists(format!("A task with ID {} already exists", task_id))
}
