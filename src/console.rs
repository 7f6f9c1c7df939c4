//! Operator keys read from stdin, one letter per line.

use crate::player::PlaybackControl;
use crate::refresh::PlaylistRefresher;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const HELP: &str = "\
Available commands:
  u  refresh playlist
  l  refresh playlist from local library
  p  mute output
  s  unmute output
  z  play
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Refresh,
    RefreshLocal,
    StopOutput,
    StartOutput,
    Play,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "u" => Some(ConsoleCommand::Refresh),
            "l" => Some(ConsoleCommand::RefreshLocal),
            "p" => Some(ConsoleCommand::StopOutput),
            "s" => Some(ConsoleCommand::StartOutput),
            "z" => Some(ConsoleCommand::Play),
            _ => None,
        }
    }
}

pub struct Console {
    player: Arc<dyn PlaybackControl>,
    refresher: Arc<PlaylistRefresher>,
}

impl Console {
    pub fn new(player: Arc<dyn PlaybackControl>, refresher: Arc<PlaylistRefresher>) -> Self {
        Self { player, refresher }
    }

    pub fn execute(&self, command: ConsoleCommand) {
        info!(?command, "Console command");
        let result = match command {
            ConsoleCommand::Refresh => {
                self.refresher.run_refresh();
                Ok(())
            }
            ConsoleCommand::RefreshLocal => {
                self.refresher.refresh_local();
                Ok(())
            }
            ConsoleCommand::StopOutput => self.player.stop_output(),
            ConsoleCommand::StartOutput => self.player.start_output(),
            ConsoleCommand::Play => self.player.play(),
        };
        if let Err(e) = result {
            error!(?command, error = %e, "Console command failed");
        }
    }

    /// Handle lines until `input` ends. Returns the number of commands run.
    pub fn run(&self, input: impl BufRead) -> usize {
        let mut handled = 0;
        for line in input.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "Console input closed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match ConsoleCommand::parse(&line) {
                Some(cmd) => {
                    self.execute(cmd);
                    handled += 1;
                }
                None => println!("{}", HELP),
            }
        }
        handled
    }

    /// Listen on stdin in a detached thread.
    pub fn spawn(self) -> std::io::Result<()> {
        println!("{}", HELP);
        std::thread::Builder::new()
            .name("console".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                self.run(stdin.lock());
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Candidate;
    use crate::downloader::{Downloader, Fetched};
    use crate::error::{Error, Result};
    use crate::library::Library;
    use crate::player::{MemoryPlayer, PlayerEvent};
    use crate::refresh::SongSource;
    use std::io::Cursor;
    use std::path::Path;
    use std::time::Duration;

    struct NoSource;
    impl SongSource for NoSource {
        fn fetch_candidates(&self) -> Option<Vec<Candidate>> {
            None
        }
    }

    struct NoDownloads;
    impl Downloader for NoDownloads {
        fn fetch(&self, _url: &str) -> Result<Fetched> {
            Err(Error::Download("offline".into()))
        }
        fn fetch_playlist(&self, _url: &str, _dest: &Path) -> Result<usize> {
            Err(Error::Download("offline".into()))
        }
    }

    #[test]
    fn parses_known_keys() {
        assert_eq!(ConsoleCommand::parse("u\n"), Some(ConsoleCommand::Refresh));
        assert_eq!(ConsoleCommand::parse(" z "), Some(ConsoleCommand::Play));
        assert_eq!(ConsoleCommand::parse("x"), None);
        assert_eq!(ConsoleCommand::parse("uu"), None);
    }

    #[test]
    fn runs_commands_from_input() {
        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(MemoryPlayer::new());
        let library = Arc::new(Library::new(
            dir.path().join("audio"),
            dir.path().join("special"),
            dir.path().join("played.txt"),
            dir.path().join("blacklist.txt"),
        ));
        let refresher = Arc::new(PlaylistRefresher::new(
            player.clone(),
            library,
            Arc::new(NoSource),
            Arc::new(NoDownloads),
            None,
            dir.path().join("tmp"),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        let console = Console::new(player.clone(), refresher);

        let handled = console.run(Cursor::new("p\n\nq\ns\nz\nl\n"));
        assert_eq!(handled, 4);
        let events = player.events();
        assert_eq!(
            events[..3],
            [PlayerEvent::StopOutput, PlayerEvent::StartOutput, PlayerEvent::Play]
        );
        // Local refresh prepared the player even with an empty library.
        assert_eq!(events[3..], [PlayerEvent::StopOutput, PlayerEvent::Clear]);
    }
}
