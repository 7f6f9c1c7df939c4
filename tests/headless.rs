//! Headless integration tests for breakcast.
//!
//! These wire the whole application with an in-memory player and a manual
//! clock, then drive the scheduler tick by tick.

use breakcast::app::App;
use breakcast::blocks::Block;
use breakcast::clock::ManualClock;
use breakcast::config::Config;
use breakcast::guard::SkipReason;
use breakcast::player::{MemoryPlayer, PlaybackControl, PlayerEvent};
use chrono::{NaiveDateTime, TimeDelta};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

fn write_wav(path: &Path, secs: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for _ in 0..(8000 * secs) {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();
}

struct Station {
    dir: TempDir,
    clock: Arc<ManualClock>,
    player: Arc<MemoryPlayer>,
    app: App,
}

/// A station on Monday 2024-03-04 with no timetable of its own and an
/// unreachable backend.
fn station(start: &str) -> Station {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.paths.base_dir = dir.path().to_path_buf();
    config.backend.url = "http://127.0.0.1:9".into();
    config.backend.attempts = 1;
    config.backend.timeout_secs = 1;
    config.schedule.refresh_times.clear();
    config.schedule.device_start_times.clear();
    config.schedule.device_stop_times.clear();

    let clock = Arc::new(ManualClock::new(dt(start)));
    let player = Arc::new(MemoryPlayer::new());
    let app = App::build(config, player.clone(), clock.clone()).unwrap();
    app.setup_schedules();
    Station {
        dir,
        clock,
        player,
        app,
    }
}

impl Station {
    fn tick_to(&self, at: &str) {
        self.clock.set(dt(at));
        self.app.scheduler.run_pending();
    }

    fn playlist(&self, name: &str, files: usize, secs: u32) -> String {
        let rel = format!("special_playlists/{}", name);
        let dir = self.dir.path().join(&rel);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..files {
            write_wav(&dir.join(format!("{:02}.wav", i)), secs);
        }
        rel
    }
}

// ── Priority playlists ────────────────────────────────────────────────────

#[test]
fn priority_playlist_takes_over_and_hands_back() {
    let s = station("2024-03-04 09:29:58");
    let rel = s.playlist("assembly", 3, 30);
    let id = s.app.orchestrator.add(&rel, "2024-03-04", "09:30").unwrap();
    assert_eq!(id, format!("priority_{}_2024-03-04_09:30", rel));
    assert!(s.app.orchestrator.get_pending().iter().any(|t| t.task_id == id));

    s.tick_to("2024-03-04 09:30:00");
    let auth = s.app.orchestrator.authority();
    assert!(auth.is_priority_playing);
    assert_eq!(auth.current_task.as_deref(), Some(id.as_str()));
    assert_eq!(auth.end_time, Some(dt("2024-03-04 09:31:30")));
    assert_eq!(s.player.queue().len(), 3);
    assert_eq!(s.player.output_level(), 1.0);

    // Recurring automation stands aside during the takeover.
    assert_eq!(s.app.guard.check(), Err(SkipReason::PriorityPlaying));

    s.tick_to("2024-03-04 09:30:30");
    s.tick_to("2024-03-04 09:31:00");
    assert!(s.app.orchestrator.authority().is_priority_playing);

    s.tick_to("2024-03-04 09:31:30");
    assert!(!s.app.orchestrator.authority().is_priority_playing);
    assert!(s.app.orchestrator.get_pending().is_empty());
    assert_eq!(s.app.guard.check(), Ok(()));

    let events = s.player.events();
    assert_eq!(
        events[events.len() - 2..],
        [PlayerEvent::Play, PlayerEvent::StartOutput]
    );
}

#[test]
fn priority_playlist_rejects_past_and_duplicate_times() {
    let s = station("2024-03-04 10:00:00");
    let rel = s.playlist("assembly", 1, 1);
    assert!(s.app.orchestrator.add(&rel, "2024-03-04", "09:59").is_err());
    assert!(s.app.orchestrator.add(&rel, "2024-03-04", "10:00").is_err());
    s.app.orchestrator.add(&rel, "2024-03-04", "10:05").unwrap();
    assert!(s.app.orchestrator.add(&rel, "2024-03-04", "10:05").is_err());
    assert_eq!(s.app.orchestrator.get_pending().len(), 1);
}

#[test]
fn priority_trigger_waits_for_its_date() {
    let s = station("2024-03-04 08:00:00");
    let rel = s.playlist("assembly", 1, 10);
    s.app.orchestrator.add(&rel, "2024-03-05", "09:00").unwrap();

    s.tick_to("2024-03-04 09:00:00");
    assert!(!s.app.orchestrator.authority().is_priority_playing);

    s.tick_to("2024-03-05 09:00:00");
    assert!(s.app.orchestrator.authority().is_priority_playing);
}

// ── Blocks ────────────────────────────────────────────────────────────────

#[test]
fn same_day_block_applies_at_once_and_playback_resumes_after() {
    let s = station("2024-03-04 10:00:00");
    s.player.enqueue(Path::new("song.mp3")).unwrap();
    s.player.play().unwrap();
    s.player.take_events();

    let block = Block::parse("2024-03-04", "09:59", "10:01").unwrap();
    assert!(s.app.enforcer.add_block(&block).unwrap());
    assert!(s.app.enforcer.is_blocked());
    assert_eq!(s.app.guard.check(), Err(SkipReason::Blocked));

    s.tick_to("2024-03-04 10:01:00");
    assert_eq!(s.player.take_events(), vec![PlayerEvent::Play]);

    s.clock.set(dt("2024-03-04 10:02:00"));
    assert!(!s.app.enforcer.is_blocked());
    assert_eq!(s.app.guard.check(), Ok(()));
}

#[test]
fn block_start_pauses_and_survives_restart() {
    let s = station("2024-03-04 07:00:00");
    let block = Block::parse("2024-03-04", "08:00", "08:10").unwrap();
    s.app.enforcer.add_block(&block).unwrap();

    // A fresh process on the same files re-arms today's block.
    let mut config = Config::default();
    config.paths.base_dir = s.dir.path().to_path_buf();
    config.schedule.refresh_times.clear();
    config.schedule.device_start_times.clear();
    config.schedule.device_stop_times.clear();
    let player = Arc::new(MemoryPlayer::new());
    let app = App::build(config, player.clone(), s.clock.clone()).unwrap();
    app.setup_schedules();

    player.enqueue(Path::new("song.mp3")).unwrap();
    player.play().unwrap();
    player.take_events();

    s.clock.set(dt("2024-03-04 08:00:00"));
    app.scheduler.run_pending();
    assert_eq!(player.take_events(), vec![PlayerEvent::Pause]);
}

#[test]
fn block_end_does_not_interrupt_priority_playlist() {
    let s = station("2024-03-04 08:58:00");
    let rel = s.playlist("assembly", 2, 60);
    s.app
        .enforcer
        .add_block(&Block::parse("2024-03-04", "08:59", "09:01").unwrap())
        .unwrap();
    s.app.orchestrator.add(&rel, "2024-03-04", "09:00").unwrap();

    s.tick_to("2024-03-04 09:00:00");
    assert!(s.app.orchestrator.authority().is_priority_playing);
    s.player.take_events();

    s.tick_to("2024-03-04 09:01:00");
    assert!(!s.player.events().contains(&PlayerEvent::Play));
}
