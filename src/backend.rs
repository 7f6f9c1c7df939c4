//! Client for the voting backend: candidate songs in, now-playing out.

use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::player::NowPlaying;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// One song the audience voted for.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Candidate {
    pub url: String,
}

#[derive(Debug, Serialize)]
struct PlayingSong<'a> {
    #[serde(rename = "SongId")]
    song_id: &'a str,
    #[serde(rename = "Duration")]
    duration: &'a str,
}

pub struct BackendClient {
    agent: ureq::Agent,
    base_url: String,
    attempts: u32,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build();
        Self {
            agent,
            base_url: config.url.trim_end_matches('/').to_string(),
            attempts: config.attempts.max(1),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Songs to play next, or `None` when every attempt failed.
    pub fn fetch_candidates(&self) -> Option<Vec<Candidate>> {
        let url = format!("{}/voting/songs-to-play", self.base_url);
        for attempt in 1..=self.attempts {
            match self.get_candidates(&url) {
                Ok(list) => {
                    info!(count = list.len(), "Fetched songs from backend");
                    return Some(list);
                }
                Err(e) => error!(attempt, error = %e, "Fetching songs from backend failed"),
            }
        }
        None
    }

    fn get_candidates(&self, url: &str) -> Result<Vec<Candidate>> {
        let response = self.agent.get(url).call().map_err(backend_error)?;
        if response.status() != 200 {
            return Err(Error::Backend(format!("unexpected status {}", response.status())));
        }
        response
            .into_json::<Vec<Candidate>>()
            .map_err(|e| Error::Backend(format!("invalid song list: {}", e)))
    }

    /// Report the track on air. True once the backend answered 200.
    pub fn post_now_playing(&self, track: &NowPlaying) -> bool {
        let url = format!("{}/voting/playing-song", self.base_url);
        let body = PlayingSong {
            song_id: &track.title,
            duration: &track.duration,
        };
        for attempt in 1..=self.attempts {
            match self.agent.post(&url).send_json(&body) {
                Ok(response) if response.status() == 200 => {
                    debug!(title = %track.title, "Reported now playing");
                    return true;
                }
                Ok(response) => {
                    warn!(attempt, status = response.status(), "Now-playing report rejected")
                }
                Err(e) => error!(attempt, error = %backend_error(e), "Now-playing report failed"),
            }
        }
        false
    }
}

fn backend_error(e: ureq::Error) -> Error {
    match e {
        ureq::Error::Status(code, _) => Error::Backend(format!("status {}", code)),
        ureq::Error::Transport(t) => Error::Backend(t.to_string()),
    }
}
