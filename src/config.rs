//! Configuration loaded from a TOML file.
//!
//! Lookup order for the file: explicit path (CLI flag or `BREAKCAST_CONFIG`),
//! then `breakcast.toml` in the working directory, then
//! `<config dir>/breakcast/breakcast.toml`. With no file at all every field
//! takes its default. Relative paths inside `[paths]` resolve against
//! `paths.base_dir`.

use crate::error::{Error, Result};
use crate::player::Ramp;
use crate::timefmt;
use chrono::{NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "breakcast.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub schedule: ScheduleConfig,
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub model: ModelConfig,
    pub playback: PlaybackConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub base_dir: PathBuf,
    /// Songs that passed screening; the local library.
    pub audio_dir: PathBuf,
    /// Fresh downloads awaiting screening.
    pub temp_dir: PathBuf,
    pub special_playlists_dir: PathBuf,
    pub played_file: PathBuf,
    pub blacklist_file: PathBuf,
    pub blocks_file: PathBuf,
    pub transcription_prompt: PathBuf,
    pub sentiment_prompt: PathBuf,
    pub profanity_pl: PathBuf,
    pub profanity_en: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            base_dir: PathBuf::from("."),
            audio_dir: PathBuf::from("audio"),
            temp_dir: PathBuf::from("audio_temp"),
            special_playlists_dir: PathBuf::from("special_playlists"),
            played_file: PathBuf::from("played_songs.txt"),
            blacklist_file: PathBuf::from("blacklisted_songs.txt"),
            blocks_file: PathBuf::from("blocks.json"),
            transcription_prompt: PathBuf::from("prompts/transcription_prompt.txt"),
            sentiment_prompt: PathBuf::from("prompts/sentiment_prompt.txt"),
            profanity_pl: PathBuf::from("profanity_pl.txt"),
            profanity_en: PathBuf::from("profanity_en.txt"),
        }
    }
}

impl PathsConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.resolve(&self.audio_dir)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.resolve(&self.temp_dir)
    }

    pub fn special_playlists_dir(&self) -> PathBuf {
        self.resolve(&self.special_playlists_dir)
    }

    pub fn played_file(&self) -> PathBuf {
        self.resolve(&self.played_file)
    }

    pub fn blacklist_file(&self) -> PathBuf {
        self.resolve(&self.blacklist_file)
    }

    pub fn blocks_file(&self) -> PathBuf {
        self.resolve(&self.blocks_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    #[serde(with = "timefmt::clock_list")]
    pub refresh_times: Vec<NaiveTime>,
    #[serde(with = "timefmt::clock_list")]
    pub device_start_times: Vec<NaiveTime>,
    #[serde(with = "timefmt::clock_list")]
    pub device_stop_times: Vec<NaiveTime>,
    /// When the played-songs list is emptied each day.
    #[serde(with = "timefmt::clock")]
    pub played_reset_time: NaiveTime,
    /// When today's block jobs are re-derived.
    #[serde(with = "timefmt::clock")]
    pub block_rederive_time: NaiveTime,
    /// Grace period after which an unfired block job is dropped.
    pub block_job_expiry_secs: u64,
    pub priority_monitor_secs: u64,
    pub now_playing_poll_secs: u64,
}

fn hms(list: &[&str]) -> Vec<NaiveTime> {
    list.iter()
        .filter_map(|s| timefmt::parse_clock_time(s).ok())
        .collect()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            refresh_times: hms(&[
                "07:45", "08:40", "09:35", "10:30", "11:25", "12:25", "13:20", "14:15", "15:10",
                "13:45",
            ]),
            device_start_times: hms(&[
                "07:51", "08:46", "09:41", "10:36", "11:31", "12:31", "13:26", "14:21", "15:16",
                "21:37",
            ]),
            device_stop_times: hms(&[
                "07:59", "08:54", "09:49", "10:44", "11:44", "12:39", "13:34", "14:29", "15:24",
                "21:39",
            ]),
            played_reset_time: NaiveTime::from_hms_opt(7, 44, 0).unwrap_or(NaiveTime::MIN),
            block_rederive_time: NaiveTime::from_hms_opt(0, 1, 0).unwrap_or(NaiveTime::MIN),
            block_job_expiry_secs: 60,
            priority_monitor_secs: 30,
            now_playing_poll_secs: 3,
        }
    }
}

impl ScheduleConfig {
    pub fn block_job_expiry(&self) -> TimeDelta {
        TimeDelta::seconds(self.block_job_expiry_secs as i64)
    }

    pub fn priority_monitor_period(&self) -> TimeDelta {
        TimeDelta::seconds(self.priority_monitor_secs as i64)
    }

    pub fn now_playing_poll(&self) -> Duration {
        Duration::from_secs(self.now_playing_poll_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 5050,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub attempts: u32,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            url: "http://127.0.0.1".to_string(),
            attempts: 3,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Falls back to the `GEMINI_API_KEY` environment variable when empty.
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            api_key: String::new(),
            model: "gemini-1.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

impl ModelConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Playlist length a full refresh aims for.
    pub refresh_target_minutes: u64,
    /// Playlist length a local-only refresh aims for.
    pub local_target_minutes: u64,
    /// Output ramp expressed in mixer units: `volume_increment` of `max_volume` per step.
    pub volume_increment: u32,
    pub max_volume: u32,
    pub ramp_interval_ms: u64,
    /// Path of the yt-dlp executable.
    pub downloader: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig {
            refresh_target_minutes: 55,
            local_target_minutes: 50,
            volume_increment: 750,
            max_volume: 65535,
            ramp_interval_ms: 15,
            downloader: "yt-dlp".to_string(),
        }
    }
}

impl PlaybackConfig {
    pub fn ramp(&self) -> Ramp {
        Ramp::from_increments(
            self.volume_increment,
            self.max_volume,
            Duration::from_millis(self.ramp_interval_ms),
        )
    }

    pub fn refresh_target(&self) -> Duration {
        Duration::from_secs(self.refresh_target_minutes * 60)
    }

    pub fn local_target(&self) -> Duration {
        Duration::from_secs(self.local_target_minutes * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for daily log files. Empty disables file logging.
    pub dir: PathBuf,
    pub level: String,
    pub stdout: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: PathBuf::from("logs"),
            level: "info".to_string(),
            stdout: true,
        }
    }
}

impl Config {
    /// Load from `explicit` if given (it must exist), otherwise from the
    /// first default location that exists, otherwise all defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) if !p.exists() => {
                return Err(Error::Config(format!("config file not found: {}", p.display())));
            }
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_locations().into_iter().find(|p| p.exists()),
        };

        let config = match path {
            Some(p) => {
                info!(path = %p.display(), "Loading configuration");
                let text = std::fs::read_to_string(&p)?;
                Self::from_toml(&text)?
            }
            None => {
                info!("No configuration file found; using defaults");
                Config::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    fn default_locations() -> Vec<PathBuf> {
        let mut locations = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            locations.push(dir.join("breakcast").join(CONFIG_FILE_NAME));
        }
        locations
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::Config("server.port must be non-zero".into()));
        }
        if self.backend.attempts == 0 {
            return Err(Error::Config("backend.attempts must be at least 1".into()));
        }
        if self.playback.volume_increment == 0 || self.playback.max_volume == 0 {
            return Err(Error::Config(
                "playback.volume_increment and playback.max_volume must be non-zero".into(),
            ));
        }
        if self.schedule.priority_monitor_secs == 0 || self.schedule.now_playing_poll_secs == 0 {
            return Err(Error::Config("schedule periods must be non-zero".into()));
        }
        Ok(())
    }
}
