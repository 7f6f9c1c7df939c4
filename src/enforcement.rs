//! Block enforcement: turns today's stored blocks into scheduler jobs that
//! pause playback when a block starts and resume it when it ends.
//!
//! All block jobs carry the `block` tag and are rebuilt as a group: at
//! startup, once a day shortly after midnight, and whenever a block is
//! removed. Adding a block for today registers its jobs straight away.

use crate::blocks::{Block, BlockStore};
use crate::error::Result;
use crate::player::PlaybackControl;
use crate::priority::AuthorityView;
use crate::scheduler::{JobHandle, JobOutcome, Scheduler, Trigger};
use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const BLOCK_TAG: &str = "block";

pub struct BlockEnforcer {
    store: Arc<BlockStore>,
    scheduler: Arc<Scheduler>,
    player: Arc<dyn PlaybackControl>,
    authority: AuthorityView,
    expire_after: TimeDelta,
}

impl BlockEnforcer {
    /// `expire_after` is the shortest lateness after which a block job is
    /// dropped unrun.
    pub fn new(
        store: Arc<BlockStore>,
        scheduler: Arc<Scheduler>,
        player: Arc<dyn PlaybackControl>,
        authority: AuthorityView,
        expire_after: TimeDelta,
    ) -> Self {
        Self {
            store,
            scheduler,
            player,
            authority,
            expire_after,
        }
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    fn now(&self) -> NaiveDateTime {
        self.scheduler.clock().now()
    }

    /// Drop every block job and register start/end jobs for each of
    /// `blocks` dated today. Returns how many jobs were registered.
    pub fn derive_today(&self, blocks: &[Block]) -> usize {
        let cancelled = self.scheduler.cancel_tag(BLOCK_TAG);
        let today = self.now().date();
        let registered: usize = blocks
            .iter()
            .filter(|b| b.date == today)
            .map(|b| self.register_block(b))
            .sum();
        info!(cancelled, registered, "Block jobs derived for {}", today);
        registered
    }

    /// Re-read the store and derive today's jobs from it.
    pub fn rederive(&self) -> usize {
        self.derive_today(&self.store.for_date(self.now().date()))
    }

    /// Register the jobs for one block if it is dated today, without waiting
    /// for the next daily derivation.
    pub fn add_immediately(&self, block: &Block) -> usize {
        if block.date != self.now().date() {
            return 0;
        }
        self.register_block(block)
    }

    /// Register the start and end jobs of `block` whose times are still ahead.
    ///
    /// A late start job still pauses while the block lasts, and a late end
    /// job still resumes on the block's own day, so a driver held up by a
    /// long post-priority refresh still enforces the block. Overnight blocks
    /// arm nothing.
    fn register_block(&self, block: &Block) -> usize {
        if block.is_overnight() {
            warn!(date = %block.date, start = %block.start_time, end = %block.end_time, "Overnight block is never enforced");
            return 0;
        }
        let now = self.now();
        let mut registered = 0;

        if block.start() > now {
            let window = (block.end() - block.start()).max(self.expire_after);
            self.register_action(block.start(), window, BlockAction::Start);
            registered += 1;
        }
        if block.end() > now {
            let midnight = block.date.and_time(NaiveTime::default()) + TimeDelta::days(1);
            let window = (midnight - block.end()).max(self.expire_after);
            self.register_action(block.end(), window, BlockAction::End);
            registered += 1;
        }
        debug!(date = %block.date, start = %block.start_time, end = %block.end_time, registered, "Block jobs registered");
        registered
    }

    fn register_action(&self, at: NaiveDateTime, expire_after: TimeDelta, action: BlockAction) -> JobHandle {
        let player = Arc::clone(&self.player);
        let authority = self.authority.clone();
        self.scheduler.register(
            Trigger::Once { at, expire_after },
            Some(BLOCK_TAG),
            move || {
                action.run(player.as_ref(), &authority);
                JobOutcome::Cancel
            },
        )
    }

    /// Daily job that rebuilds block jobs, e.g. at 00:01.
    pub fn install_daily(self: &Arc<Self>, at: NaiveTime) -> JobHandle {
        let me = Arc::downgrade(self);
        self.scheduler.register_daily(at, move || match me.upgrade() {
            Some(enforcer) => {
                enforcer.rederive();
                JobOutcome::Continue
            }
            None => JobOutcome::Cancel,
        })
    }

    /// Store a block and arm it if it falls today. `Ok(false)` on duplicates.
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        if !self.store.add(block)? {
            return Ok(false);
        }
        self.add_immediately(block);
        Ok(true)
    }

    /// Remove a block and rebuild today's jobs so it no longer fires.
    pub fn remove_block(&self, block: &Block) -> Result<bool> {
        if !self.store.remove(block)? {
            return Ok(false);
        }
        if block.date == self.now().date() {
            self.rederive();
        }
        Ok(true)
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.store.list()
    }

    /// True while the current time sits inside a block dated today.
    pub fn is_blocked(&self) -> bool {
        self.store.is_blocked_at(self.now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockAction {
    Start,
    End,
}

impl BlockAction {
    fn run(self, player: &dyn PlaybackControl, authority: &AuthorityView) {
        match self {
            BlockAction::Start => {
                if player.is_playing() {
                    info!("Block started; pausing playback");
                    if let Err(e) = player.pause() {
                        error!(error = %e, "Could not pause for block");
                    }
                } else {
                    debug!("Block started; nothing playing");
                }
            }
            BlockAction::End => {
                if authority.is_priority_playing() {
                    info!("Block ended during a priority playlist; leaving playback alone");
                    return;
                }
                info!("Block ended; resuming playback");
                if let Err(e) = player.play() {
                    error!(error = %e, "Could not resume after block");
                }
            }
        }
    }
}
