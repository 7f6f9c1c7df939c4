//! Reports the track on air to the backend whenever it changes.

use crate::backend::BackendClient;
use crate::player::{NowPlaying, PlaybackControl};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub trait Announcer: Send + Sync {
    /// True once the announcement was accepted.
    fn announce(&self, track: &NowPlaying) -> bool;
}

impl Announcer for BackendClient {
    fn announce(&self, track: &NowPlaying) -> bool {
        self.post_now_playing(track)
    }
}

pub struct NowPlayingReporter {
    player: Arc<dyn PlaybackControl>,
    announcer: Arc<dyn Announcer>,
    last_title: Option<String>,
}

impl NowPlayingReporter {
    pub fn new(player: Arc<dyn PlaybackControl>, announcer: Arc<dyn Announcer>) -> Self {
        Self {
            player,
            announcer,
            last_title: None,
        }
    }

    /// Check the player once. Returns true if a new title was announced.
    /// A failed announcement is retried on the next poll.
    pub fn poll(&mut self) -> bool {
        let Some(current) = self.player.now_playing() else {
            return false;
        };
        if self.last_title.as_deref() == Some(current.title.as_str()) {
            return false;
        }
        if self.announcer.announce(&current) {
            info!(title = %current.title, duration = %current.duration, "Now playing");
            self.last_title = Some(current.title);
            true
        } else {
            warn!(title = %current.title, "Could not report now playing");
            false
        }
    }

    pub fn spawn(mut self, every: Duration) -> std::io::Result<ReporterHandle> {
        let (tx, rx) = mpsc::channel::<()>();
        let join = std::thread::Builder::new()
            .name("now-playing".into())
            .spawn(move || {
                debug!("Now-playing reporter started");
                loop {
                    self.poll();
                    match rx.recv_timeout(every) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Now-playing reporter stopped");
            })?;
        Ok(ReporterHandle {
            tx,
            join: Some(join),
        })
    }
}

pub struct ReporterHandle {
    tx: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl Drop for ReporterHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::MemoryPlayer;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        failing: AtomicBool,
    }

    impl Announcer for Recorder {
        fn announce(&self, track: &NowPlaying) -> bool {
            if self.failing.load(Ordering::SeqCst) {
                return false;
            }
            self.seen.lock().unwrap().push(track.title.clone());
            true
        }
    }

    fn setup() -> (Arc<MemoryPlayer>, Arc<Recorder>, NowPlayingReporter) {
        let player = Arc::new(MemoryPlayer::new());
        let recorder = Arc::new(Recorder::default());
        let reporter = NowPlayingReporter::new(player.clone(), recorder.clone());
        (player, recorder, reporter)
    }

    #[test]
    fn announces_only_on_title_change() {
        let (player, recorder, mut reporter) = setup();
        assert!(!reporter.poll());

        player.enqueue(Path::new("one.mp3")).unwrap();
        player.enqueue(Path::new("two.mp3")).unwrap();
        player.play().unwrap();
        assert!(reporter.poll());
        assert!(!reporter.poll());

        player.skip().unwrap();
        assert!(reporter.poll());
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn failed_announcement_is_retried() {
        let (player, recorder, mut reporter) = setup();
        player.enqueue(Path::new("one.mp3")).unwrap();
        player.play().unwrap();

        recorder.failing.store(true, Ordering::SeqCst);
        assert!(!reporter.poll());
        recorder.failing.store(false, Ordering::SeqCst);
        assert!(reporter.poll());
    }

    #[test]
    fn thread_stops_on_drop() {
        let (_player, _recorder, reporter) = setup();
        let handle = reporter.spawn(Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        drop(handle);
    }
}
