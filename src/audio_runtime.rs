//! AudioRuntime: dedicated audio thread with channel-based command dispatch.
//!
//! The rodio output stream is not `Send`, so it lives on one thread for its
//! whole life. `RodioPlayer` wraps the command sender and implements
//! `PlaybackControl`; queries carry a reply channel. Track-end detection
//! happens inside the thread loop via `recv_timeout` + `sink.empty()`.

use crate::error::{Error, Result};
use crate::player::{NowPlaying, PlaybackControl, Ramp};
use crate::track::Track;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL: Duration = Duration::from_millis(50);
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

// ── Commands ─────────────────────────────────────────────────────────────────

enum AudioCmd {
    Play,
    Pause,
    Skip,
    Clear,
    Enqueue(PathBuf),
    SetVolume(u8),
    SetLevel(f32),
    Status(mpsc::Sender<AudioStatus>),
    Shutdown,
}

#[derive(Debug, Clone)]
struct AudioStatus {
    playing: bool,
    volume: u8,
    level: f32,
    current: Option<NowPlaying>,
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// `PlaybackControl` backed by rodio on the default output device.
pub struct RodioPlayer {
    tx: mpsc::Sender<AudioCmd>,
    ramp: Ramp,
}

impl RodioPlayer {
    /// Spawn the audio thread. The output device is opened lazily on the
    /// first track, so this succeeds on machines without audio hardware.
    pub fn spawn(ramp: Ramp) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<AudioCmd>();

        std::thread::Builder::new()
            .name("audio-runtime".into())
            .spawn(move || audio_thread_loop(rx))
            .map_err(|e| Error::Playback(format!("failed to spawn audio thread: {}", e)))?;

        Ok(RodioPlayer { tx, ramp })
    }

    fn send(&self, cmd: AudioCmd) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| Error::Playback("audio thread has stopped".into()))
    }

    fn status(&self) -> Result<AudioStatus> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(AudioCmd::Status(reply_tx))?;
        reply_rx
            .recv_timeout(QUERY_TIMEOUT)
            .map_err(|_| Error::Playback("audio thread did not answer".into()))
    }

    fn ramp_to(&self, target: f32) -> Result<()> {
        let from = self.status()?.level;
        for level in self.ramp.levels(from, target) {
            self.send(AudioCmd::SetLevel(level))?;
            std::thread::sleep(self.ramp.interval);
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(AudioCmd::Shutdown);
    }
}

impl Drop for RodioPlayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PlaybackControl for RodioPlayer {
    fn play(&self) -> Result<()> {
        self.send(AudioCmd::Play)
    }

    fn pause(&self) -> Result<()> {
        self.send(AudioCmd::Pause)
    }

    fn skip(&self) -> Result<()> {
        self.send(AudioCmd::Skip)
    }

    fn set_volume(&self, volume: u8) -> Result<()> {
        self.send(AudioCmd::SetVolume(volume.min(100)))
    }

    fn volume(&self) -> Result<u8> {
        Ok(self.status()?.volume)
    }

    fn is_playing(&self) -> bool {
        self.status().map(|s| s.playing).unwrap_or(false)
    }

    fn clear_queue(&self) -> Result<()> {
        self.send(AudioCmd::Clear)
    }

    fn enqueue(&self, path: &Path) -> Result<()> {
        self.send(AudioCmd::Enqueue(path.to_path_buf()))
    }

    fn now_playing(&self) -> Option<NowPlaying> {
        self.status().ok().and_then(|s| s.current)
    }

    fn start_output(&self) -> Result<()> {
        // Always ramp from silence, like a mixer fader brought up from zero.
        self.send(AudioCmd::SetLevel(0.0))?;
        self.ramp_to(1.0)
    }

    fn stop_output(&self) -> Result<()> {
        self.ramp_to(0.0)
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────────

struct Output {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

/// State owned by the audio thread.
struct Runtime {
    output: Option<Output>,
    queue: VecDeque<Track>,
    current: Option<(Track, Sink)>,
    /// Listener intent: keep advancing through the queue.
    playing: bool,
    volume: u8,
    level: f32,
}

impl Runtime {
    fn new() -> Self {
        Runtime {
            output: None,
            queue: VecDeque::new(),
            current: None,
            playing: false,
            volume: 100,
            level: 1.0,
        }
    }

    fn gain(&self) -> f32 {
        (self.volume as f32 / 100.0) * self.level
    }

    fn apply_gain(&self) {
        if let Some((_, sink)) = &self.current {
            sink.set_volume(self.gain());
        }
    }

    fn output(&mut self) -> Result<&OutputStreamHandle> {
        if self.output.is_none() {
            let (stream, handle) = OutputStream::try_default()
                .map_err(|e| Error::Playback(format!("Failed to open audio output: {}", e)))?;
            self.output = Some(Output {
                _stream: stream,
                handle,
            });
        }
        match &self.output {
            Some(out) => Ok(&out.handle),
            None => Err(Error::Playback("audio output unavailable".into())),
        }
    }

    /// Load the next playable track from the queue into a fresh sink.
    fn advance(&mut self) {
        self.current = None;
        while let Some(track) = self.queue.pop_front() {
            match self.start_track(&track) {
                Ok(sink) => {
                    info!(title = %track.title, "Now playing");
                    self.current = Some((track, sink));
                    return;
                }
                Err(e) => warn!(file = %track.path.display(), error = %e, "Skipping unplayable track"),
            }
        }
        debug!("Queue exhausted");
        self.playing = false;
    }

    fn start_track(&mut self, track: &Track) -> Result<Sink> {
        let gain = self.gain();
        let playing = self.playing;
        let handle = self.output()?;
        let sink = Sink::try_new(handle)
            .map_err(|e| Error::Playback(format!("Failed to create audio sink: {}", e)))?;
        let file = File::open(&track.path)?;
        let source = Decoder::new(BufReader::new(file))
            .map_err(|e| Error::Audio(format!("Cannot decode '{}': {}", track.path.display(), e)))?;
        sink.set_volume(gain);
        sink.append(source);
        if !playing {
            sink.pause();
        }
        Ok(sink)
    }

    fn handle(&mut self, cmd: AudioCmd) {
        match cmd {
            AudioCmd::Play => {
                self.playing = true;
                match &self.current {
                    Some((_, sink)) => sink.play(),
                    None => self.advance(),
                }
            }
            AudioCmd::Pause => {
                self.playing = false;
                if let Some((_, sink)) = &self.current {
                    sink.pause();
                }
            }
            AudioCmd::Skip => {
                if let Some((_, sink)) = self.current.take() {
                    sink.stop();
                }
                self.advance();
            }
            AudioCmd::Clear => {
                if let Some((_, sink)) = self.current.take() {
                    sink.stop();
                }
                self.queue.clear();
                self.playing = false;
            }
            AudioCmd::Enqueue(path) => {
                let track = Track::from_path(&path).unwrap_or_else(|e| {
                    warn!(error = %e, "Queued track has unreadable tags");
                    Track::untagged(&path)
                });
                self.queue.push_back(track);
            }
            AudioCmd::SetVolume(volume) => {
                self.volume = volume;
                self.apply_gain();
            }
            AudioCmd::SetLevel(level) => {
                self.level = level.clamp(0.0, 1.0);
                self.apply_gain();
            }
            AudioCmd::Status(reply) => {
                let _ = reply.send(AudioStatus {
                    playing: self.playing && self.current.is_some(),
                    volume: self.volume,
                    level: self.level,
                    current: self.current.as_ref().map(|(t, _)| NowPlaying::from(t)),
                });
            }
            AudioCmd::Shutdown => {}
        }
    }

    fn tick(&mut self) {
        let finished = matches!(&self.current, Some((_, sink)) if sink.empty());
        if finished && self.playing {
            self.advance();
        }
    }
}

fn audio_thread_loop(rx: mpsc::Receiver<AudioCmd>) {
    let mut rt = Runtime::new();

    loop {
        match rx.recv_timeout(POLL) {
            Ok(AudioCmd::Shutdown) => break,
            Ok(cmd) => rt.handle(cmd),
            Err(mpsc::RecvTimeoutError::Timeout) => rt.tick(),
            // All senders dropped
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some((_, sink)) = rt.current.take() {
        sink.stop();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
