//! breakcast: break-time radio automation.
//!
//! Scheduling, block enforcement, priority playlists and the playlist
//! refresh pipeline live here. The binary wires them to the audio device,
//! the control server and the console.

pub mod api;
pub mod app;
pub mod audio_runtime;
pub mod backend;
pub mod blocks;
pub mod clock;
pub mod config;
pub mod console;
pub mod downloader;
pub mod enforcement;
pub mod error;
pub mod gemini;
pub mod guard;
pub mod library;
pub mod logging;
pub mod now_playing;
pub mod player;
pub mod priority;
pub mod refresh;
pub mod scheduler;
pub mod text_analysis;
pub mod timefmt;
pub mod track;
