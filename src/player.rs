//! Playback capability shared by every component that drives the audio
//! device, plus an in-memory implementation for headless runs.

use crate::error::Result;
use crate::track::{self, Track};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Title and length of the track currently loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NowPlaying {
    pub title: String,
    /// HH:MM:SS
    pub duration: String,
}

impl From<&Track> for NowPlaying {
    fn from(track: &Track) -> Self {
        NowPlaying {
            title: track.title.clone(),
            duration: track.duration_display(),
        }
    }
}

pub trait PlaybackControl: Send + Sync {
    /// Start or resume the queue.
    fn play(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    /// Jump to the next queued track.
    fn skip(&self) -> Result<()>;
    /// Player volume, 0-100.
    fn set_volume(&self, volume: u8) -> Result<()>;
    fn volume(&self) -> Result<u8>;
    fn is_playing(&self) -> bool;
    /// Stop and forget every queued track.
    fn clear_queue(&self) -> Result<()>;
    fn enqueue(&self, path: &Path) -> Result<()>;
    fn now_playing(&self) -> Option<NowPlaying>;
    /// Ramp the output device up to full level.
    fn start_output(&self) -> Result<()>;
    /// Ramp the output device down to silence.
    fn stop_output(&self) -> Result<()>;

    /// Silence the output and empty the queue ahead of loading a new playlist.
    fn prepare_for_update(&self) -> Result<()> {
        self.stop_output()?;
        self.clear_queue()
    }
}

/// Stepwise output-level ramp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ramp {
    /// Fraction of full level per step.
    pub step: f32,
    pub interval: Duration,
}

impl Ramp {
    /// A ramp expressed in mixer units, e.g. 750 of 65535 per step.
    pub fn from_increments(increment: u32, max: u32, interval: Duration) -> Self {
        let step = if max == 0 {
            1.0
        } else {
            (increment as f32 / max as f32).clamp(f32::EPSILON, 1.0)
        };
        Ramp { step, interval }
    }

    /// Intermediate levels from `from` to `to`, ending exactly on `to`.
    pub fn levels(&self, from: f32, to: f32) -> Vec<f32> {
        let mut levels = Vec::new();
        let mut level = from.clamp(0.0, 1.0);
        let to = to.clamp(0.0, 1.0);
        while (level - to).abs() > f32::EPSILON {
            level = if to > level {
                (level + self.step).min(to)
            } else {
                (level - self.step).max(to)
            };
            levels.push(level);
        }
        levels
    }
}

impl Default for Ramp {
    fn default() -> Self {
        Ramp::from_increments(750, 65535, Duration::from_millis(15))
    }
}

/// Something the in-memory player was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Play,
    Pause,
    Skip,
    Clear,
    Enqueue(PathBuf),
    SetVolume(u8),
    StartOutput,
    StopOutput,
}

#[derive(Debug)]
struct MemoryState {
    queue: Vec<PathBuf>,
    position: usize,
    playing: bool,
    volume: u8,
    output_level: f32,
    events: Vec<PlayerEvent>,
}

/// Player without an audio device. Tracks queue and transport state and
/// records every call, for headless operation and tests.
#[derive(Debug)]
pub struct MemoryPlayer {
    state: Mutex<MemoryState>,
}

impl Default for MemoryPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlayer {
    pub fn new() -> Self {
        MemoryPlayer {
            state: Mutex::new(MemoryState {
                queue: Vec::new(),
                position: 0,
                playing: false,
                volume: 100,
                output_level: 1.0,
                events: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> Vec<PlayerEvent> {
        self.lock().events.clone()
    }

    /// Drain the event log.
    pub fn take_events(&self) -> Vec<PlayerEvent> {
        std::mem::take(&mut self.lock().events)
    }

    pub fn queue(&self) -> Vec<PathBuf> {
        self.lock().queue.clone()
    }

    pub fn output_level(&self) -> f32 {
        self.lock().output_level
    }

    /// Force the transport state, e.g. to simulate a listener pressing play.
    pub fn set_playing(&self, playing: bool) {
        self.lock().playing = playing;
    }
}

impl PlaybackControl for MemoryPlayer {
    fn play(&self) -> Result<()> {
        let mut s = self.lock();
        s.playing = true;
        s.events.push(PlayerEvent::Play);
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut s = self.lock();
        s.playing = false;
        s.events.push(PlayerEvent::Pause);
        Ok(())
    }

    fn skip(&self) -> Result<()> {
        let mut s = self.lock();
        if s.position < s.queue.len() {
            s.position += 1;
        }
        s.events.push(PlayerEvent::Skip);
        Ok(())
    }

    fn set_volume(&self, volume: u8) -> Result<()> {
        let mut s = self.lock();
        let volume = volume.min(100);
        s.volume = volume;
        s.events.push(PlayerEvent::SetVolume(volume));
        Ok(())
    }

    fn volume(&self) -> Result<u8> {
        Ok(self.lock().volume)
    }

    fn is_playing(&self) -> bool {
        let s = self.lock();
        s.playing && s.position < s.queue.len()
    }

    fn clear_queue(&self) -> Result<()> {
        let mut s = self.lock();
        s.queue.clear();
        s.position = 0;
        s.playing = false;
        s.events.push(PlayerEvent::Clear);
        Ok(())
    }

    fn enqueue(&self, path: &Path) -> Result<()> {
        let mut s = self.lock();
        s.queue.push(path.to_path_buf());
        s.events.push(PlayerEvent::Enqueue(path.to_path_buf()));
        Ok(())
    }

    fn now_playing(&self) -> Option<NowPlaying> {
        let path = {
            let s = self.lock();
            s.queue.get(s.position).cloned()?
        };
        let track = Track::from_path(&path).unwrap_or_else(|_| Track::untagged(&path));
        Some(NowPlaying::from(&track))
    }

    fn start_output(&self) -> Result<()> {
        let mut s = self.lock();
        s.output_level = 1.0;
        s.events.push(PlayerEvent::StartOutput);
        Ok(())
    }

    fn stop_output(&self) -> Result<()> {
        let mut s = self.lock();
        s.output_level = 0.0;
        s.events.push(PlayerEvent::StopOutput);
        Ok(())
    }
}

/// Enqueue every supported file in `dir`. Returns how many were queued.
pub fn enqueue_directory(player: &dyn PlaybackControl, dir: &Path) -> Result<usize> {
    let files = track::list_audio_files(dir)?;
    for file in &files {
        player.enqueue(file)?;
    }
    Ok(files.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_from_mixer_units() {
        let ramp = Ramp::from_increments(750, 65535, Duration::ZERO);
        let up = ramp.levels(0.0, 1.0);
        // ceil(65535 / 750) steps
        assert_eq!(up.len(), 88);
        assert_eq!(*up.last().unwrap(), 1.0);
        assert!(up.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ramp_down_ends_at_zero() {
        let ramp = Ramp::from_increments(1, 4, Duration::ZERO);
        assert_eq!(ramp.levels(1.0, 0.0), vec![0.75, 0.5, 0.25, 0.0]);
        assert!(ramp.levels(0.0, 0.0).is_empty());
    }

    #[test]
    fn memory_player_tracks_queue_and_transport() {
        let player = MemoryPlayer::new();
        assert!(!player.is_playing());
        player.enqueue(Path::new("a.mp3")).unwrap();
        player.enqueue(Path::new("b.mp3")).unwrap();
        player.play().unwrap();
        assert!(player.is_playing());
        assert_eq!(player.now_playing().unwrap().title, "a");

        player.skip().unwrap();
        assert_eq!(player.now_playing().unwrap().title, "b");
        player.skip().unwrap();
        assert!(!player.is_playing());
        assert!(player.now_playing().is_none());
    }

    #[test]
    fn prepare_for_update_silences_and_clears() {
        let player = MemoryPlayer::new();
        player.enqueue(Path::new("a.mp3")).unwrap();
        player.take_events();

        player.prepare_for_update().unwrap();
        assert_eq!(player.events(), vec![PlayerEvent::StopOutput, PlayerEvent::Clear]);
        assert_eq!(player.output_level(), 0.0);
        assert!(player.queue().is_empty());
    }

    #[test]
    fn volume_is_capped() {
        let player = MemoryPlayer::new();
        player.set_volume(250).unwrap();
        assert_eq!(player.volume().unwrap(), 100);
        assert_eq!(player.events(), vec![PlayerEvent::SetVolume(100)]);
    }
}
