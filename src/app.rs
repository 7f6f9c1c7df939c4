//! Wiring: builds every component from a `Config` and installs the daily
//! timetable on the scheduler.

use crate::api::AppState;
use crate::backend::BackendClient;
use crate::blocks::BlockStore;
use crate::clock::Clock;
use crate::config::Config;
use crate::downloader::{Downloader, YtDlp};
use crate::enforcement::BlockEnforcer;
use crate::error::Result;
use crate::gemini::GeminiClient;
use crate::guard::Guard;
use crate::library::Library;
use crate::player::PlaybackControl;
use crate::priority::{AuthorityView, PriorityOrchestrator};
use crate::refresh::{PlaylistRefresher, Screening};
use crate::scheduler::{JobOutcome, Scheduler};
use crate::text_analysis::TextAnalyzer;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct App {
    pub config: Config,
    pub scheduler: Arc<Scheduler>,
    pub player: Arc<dyn PlaybackControl>,
    pub library: Arc<Library>,
    pub backend: Arc<BackendClient>,
    pub downloader: Arc<dyn Downloader>,
    pub refresher: Arc<PlaylistRefresher>,
    pub orchestrator: Arc<PriorityOrchestrator>,
    pub enforcer: Arc<BlockEnforcer>,
    pub guard: Guard,
}

impl App {
    pub fn build(config: Config, player: Arc<dyn PlaybackControl>, clock: Arc<dyn Clock>) -> Result<Self> {
        let paths = &config.paths;
        let scheduler = Arc::new(Scheduler::new(clock.clone()));

        let library = Arc::new(Library::new(
            paths.audio_dir(),
            paths.special_playlists_dir(),
            paths.played_file(),
            paths.blacklist_file(),
        ));
        library.ensure_dirs()?;

        let backend = Arc::new(BackendClient::new(&config.backend));
        let downloader: Arc<dyn Downloader> = Arc::new(YtDlp::new(
            config.playback.downloader.clone(),
            paths.temp_dir(),
            paths.audio_dir(),
        ));

        // Shared before the orchestrator exists so refreshes back off during
        // a takeover.
        let authority = AuthorityView::idle();
        let refresher = Arc::new(PlaylistRefresher::new(
            player.clone(),
            library.clone(),
            backend.clone(),
            downloader.clone(),
            build_screening(&config),
            paths.temp_dir(),
            config.playback.refresh_target(),
            config.playback.local_target(),
        )
        .yield_to(authority.clone()));

        let orchestrator = PriorityOrchestrator::with_authority(
            authority,
            scheduler.clone(),
            player.clone(),
            refresher.clone(),
            paths.base_dir.clone(),
            config.schedule.priority_monitor_period(),
        );

        let enforcer = Arc::new(BlockEnforcer::new(
            Arc::new(BlockStore::new(paths.blocks_file())),
            scheduler.clone(),
            player.clone(),
            orchestrator.view(),
            config.schedule.block_job_expiry(),
        ));

        let guard = Guard::new(orchestrator.view(), enforcer.clone(), clock);

        Ok(App {
            config,
            scheduler,
            player,
            library,
            backend,
            downloader,
            refresher,
            orchestrator,
            enforcer,
            guard,
        })
    }

    /// Install the daily timetable, today's block jobs and the played-list
    /// reset. Also clears the played list once, as on every start.
    pub fn setup_schedules(&self) -> usize {
        let schedule = &self.config.schedule;
        let mut jobs = 0;

        for &at in &schedule.refresh_times {
            let guard = self.guard.clone();
            let refresher = self.refresher.clone();
            self.scheduler.register_daily(at, move || {
                guard.run("playlist refresh", || spawn_refresh(refresher.clone()));
                JobOutcome::Continue
            });
            jobs += 1;
        }

        for &at in &schedule.device_stop_times {
            let guard = self.guard.clone();
            let player = self.player.clone();
            self.scheduler.register_daily(at, move || {
                if let Some(Err(e)) = guard.run("device stop", || player.stop_output()) {
                    error!(error = %e, "Device stop failed");
                }
                JobOutcome::Continue
            });
            jobs += 1;
        }

        for &at in &schedule.device_start_times {
            let guard = self.guard.clone();
            let player = self.player.clone();
            self.scheduler.register_daily(at, move || {
                let started = guard.run("device start", || {
                    player.start_output().and_then(|()| player.play())
                });
                if let Some(Err(e)) = started {
                    error!(error = %e, "Device start failed");
                }
                JobOutcome::Continue
            });
            jobs += 1;
        }

        let library = self.library.clone();
        self.scheduler.register_daily(schedule.played_reset_time, move || {
            if let Err(e) = library.clear_played() {
                error!(error = %e, "Could not clear played songs");
            }
            JobOutcome::Continue
        });
        jobs += 1;

        self.enforcer.install_daily(schedule.block_rederive_time);
        jobs += 1;
        jobs += self.enforcer.rederive();

        if let Err(e) = self.library.clear_played() {
            warn!(error = %e, "Could not clear played songs at startup");
        }

        info!(jobs, "All schedules have been configured");
        jobs
    }

    pub fn api_state(&self) -> AppState {
        AppState {
            player: self.player.clone(),
            orchestrator: self.orchestrator.clone(),
            enforcer: self.enforcer.clone(),
            library: self.library.clone(),
            downloader: self.downloader.clone(),
        }
    }
}

/// Refreshes can take minutes of network work; keep them off the scheduler
/// thread so priority triggers stay on time.
fn spawn_refresh(refresher: Arc<PlaylistRefresher>) {
    let spawned = std::thread::Builder::new()
        .name("refresh".into())
        .spawn(move || {
            refresher.run_refresh();
        });
    if let Err(e) = spawned {
        error!(error = %e, "Could not start playlist refresh");
    }
}

/// Lyrics screening needs the model key, both prompts and both word lists.
/// Anything missing disables it with a warning.
pub fn build_screening(config: &Config) -> Option<Screening> {
    let paths = &config.paths;
    let built = (|| -> Result<Screening> {
        let analyzer = TextAnalyzer::from_files(
            &paths.resolve(&paths.profanity_pl),
            &paths.resolve(&paths.profanity_en),
        )?;
        let transcriber =
            GeminiClient::with_prompt_file(&config.model, &paths.resolve(&paths.transcription_prompt))?;
        let classifier =
            GeminiClient::with_prompt_file(&config.model, &paths.resolve(&paths.sentiment_prompt))?;
        Ok(Screening {
            transcriber: Arc::new(transcriber),
            classifier: Arc::new(classifier),
            analyzer,
        })
    })();
    built
        .inspect_err(|e| warn!(error = %e, "Lyrics screening disabled"))
        .ok()
}
