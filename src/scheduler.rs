//! Scheduler: one registry of timed jobs ordered by next fire time.
//!
//! Jobs are daily (fire at a time of day, every day), one-off (fire once at a
//! given moment unless more than `expire_after` has passed), or interval
//! (fire every `period`). A single driver thread calls `run_pending` at most
//! one second apart. Missed firings are never replayed: a daily job that was
//! due while the process was down is rescheduled for its next occurrence.
//!
//! Callbacks run outside the registry lock, so they may register or cancel
//! jobs (including themselves) freely.

use crate::clock::Clock;
use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Longest the driver sleeps between two passes.
const MAX_TICK: Duration = Duration::from_secs(1);

/// Opaque handle to a registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// What a callback wants to happen to its own job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Continue,
    Cancel,
}

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Daily(NaiveTime),
    Once {
        at: NaiveDateTime,
        expire_after: TimeDelta,
    },
    Interval(TimeDelta),
}

impl Trigger {
    /// First fire time for a job registered at `now`.
    fn first_run(&self, now: NaiveDateTime) -> NaiveDateTime {
        match *self {
            Trigger::Daily(at) => next_daily(now, at),
            Trigger::Once { at, .. } => at,
            Trigger::Interval(period) => now + period,
        }
    }

    /// Fire time after a run that completed at `now`. `None` retires the job.
    fn following_run(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match *self {
            Trigger::Daily(at) => Some(next_daily(now, at)),
            Trigger::Once { .. } => None,
            Trigger::Interval(period) => Some(now + period),
        }
    }

    fn expired(&self, now: NaiveDateTime) -> bool {
        match *self {
            Trigger::Once { at, expire_after } => now > at + expire_after,
            _ => false,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Daily(at) => write!(f, "daily at {}", at.format("%H:%M:%S")),
            Trigger::Once { at, .. } => write!(f, "once at {}", at.format("%Y-%m-%d %H:%M:%S")),
            Trigger::Interval(p) => write!(f, "every {}s", p.num_seconds()),
        }
    }
}

/// Next occurrence of `at` strictly after `now`.
pub fn next_daily(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

type Callback = Box<dyn FnMut() -> JobOutcome + Send>;

struct Job {
    trigger: Trigger,
    tag: Option<String>,
    next_run: NaiveDateTime,
    /// `None` while the callback is executing.
    callback: Option<Callback>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    jobs: HashMap<JobHandle, Job>,
    /// (next_run, handle) for every job that is waiting to fire.
    queue: BTreeSet<(NaiveDateTime, JobHandle)>,
}

impl Registry {
    fn remove(&mut self, handle: JobHandle) -> bool {
        match self.jobs.remove(&handle) {
            Some(job) => {
                self.queue.remove(&(job.next_run, handle));
                true
            }
            None => false,
        }
    }
}

/// The job registry. Share it as `Arc<Scheduler>`.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    registry: Mutex<Registry>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Registry invariants hold between statements, so a poisoned lock is usable.
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job with an optional group tag.
    pub fn register<F>(&self, trigger: Trigger, tag: Option<&str>, callback: F) -> JobHandle
    where
        F: FnMut() -> JobOutcome + Send + 'static,
    {
        let now = self.clock.now();
        let next_run = trigger.first_run(now);
        let mut reg = self.lock();
        reg.next_id += 1;
        let handle = JobHandle(reg.next_id);
        reg.jobs.insert(
            handle,
            Job {
                trigger,
                tag: tag.map(str::to_string),
                next_run,
                callback: Some(Box::new(callback)),
            },
        );
        reg.queue.insert((next_run, handle));
        debug!(%handle, %trigger, tag = tag.unwrap_or("-"), next_run = %next_run, "Job registered");
        handle
    }

    /// Fire `callback` at `at` every day until cancelled.
    pub fn register_daily<F>(&self, at: NaiveTime, callback: F) -> JobHandle
    where
        F: FnMut() -> JobOutcome + Send + 'static,
    {
        self.register(Trigger::Daily(at), None, callback)
    }

    /// Fire `callback` once at `at` today. The job is dropped without firing
    /// if no tick reaches it within `expire_after` of that moment.
    pub fn register_once_at<F>(&self, at: NaiveTime, expire_after: TimeDelta, callback: F) -> JobHandle
    where
        F: FnMut() -> JobOutcome + Send + 'static,
    {
        let at = self.clock.today().and_time(at);
        self.register(Trigger::Once { at, expire_after }, None, callback)
    }

    /// Fire `callback` every `period` until it returns `JobOutcome::Cancel`
    /// or the job is cancelled.
    pub fn register_interval<F>(&self, period: TimeDelta, callback: F) -> JobHandle
    where
        F: FnMut() -> JobOutcome + Send + 'static,
    {
        self.register(Trigger::Interval(period), None, callback)
    }

    /// Remove a job. Returns false if it was already gone.
    pub fn cancel(&self, handle: JobHandle) -> bool {
        let removed = self.lock().remove(handle);
        if removed {
            debug!(%handle, "Job cancelled");
        }
        removed
    }

    /// Remove every job carrying `tag`. Returns how many were removed.
    pub fn cancel_tag(&self, tag: &str) -> usize {
        let mut reg = self.lock();
        let handles: Vec<JobHandle> = reg
            .jobs
            .iter()
            .filter(|(_, job)| job.tag.as_deref() == Some(tag))
            .map(|(h, _)| *h)
            .collect();
        for h in &handles {
            reg.remove(*h);
        }
        if !handles.is_empty() {
            debug!(tag, count = handles.len(), "Tagged jobs cancelled");
        }
        handles.len()
    }

    pub fn contains(&self, handle: JobHandle) -> bool {
        self.lock().jobs.contains_key(&handle)
    }

    pub fn next_run(&self, handle: JobHandle) -> Option<NaiveDateTime> {
        self.lock().jobs.get(&handle).map(|j| j.next_run)
    }

    /// Handles of jobs carrying `tag`, in fire order.
    pub fn tagged(&self, tag: &str) -> Vec<JobHandle> {
        let reg = self.lock();
        let mut jobs: Vec<(NaiveDateTime, JobHandle)> = reg
            .jobs
            .iter()
            .filter(|(_, job)| job.tag.as_deref() == Some(tag))
            .map(|(h, job)| (job.next_run, *h))
            .collect();
        jobs.sort();
        jobs.into_iter().map(|(_, h)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest pending fire time.
    pub fn next_due(&self) -> Option<NaiveDateTime> {
        self.lock().queue.first().map(|(at, _)| *at)
    }

    /// Run every job that is due now, in (fire time, registration) order.
    /// Returns the number of callbacks executed.
    pub fn run_pending(&self) -> usize {
        let now = self.clock.now();
        let due = self.take_due(now);
        let mut ran = 0;

        for (handle, mut callback) in due {
            ran += 1;
            let outcome = match catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(%handle, "Job callback panicked; keeping the job scheduled");
                    JobOutcome::Continue
                }
            };
            self.finish(handle, callback, outcome);
        }
        ran
    }

    /// Pull due jobs off the queue and take their callbacks. Expired one-off
    /// jobs are dropped here without running.
    fn take_due(&self, now: NaiveDateTime) -> Vec<(JobHandle, Callback)> {
        let mut reg = self.lock();
        let mut due = Vec::new();

        while let Some(&(at, handle)) = reg.queue.first() {
            if at > now {
                break;
            }
            reg.queue.remove(&(at, handle));

            let Some(job) = reg.jobs.get_mut(&handle) else {
                continue;
            };
            if job.trigger.expired(now) {
                debug!(%handle, trigger = %job.trigger, "One-off job expired without firing");
                reg.jobs.remove(&handle);
                continue;
            }
            match job.callback.take() {
                Some(cb) => due.push((handle, cb)),
                None => warn!(%handle, "Job already running; skipping this firing"),
            }
        }
        due
    }

    /// Put a job back after its callback ran, or retire it.
    fn finish(&self, handle: JobHandle, callback: Callback, outcome: JobOutcome) {
        let now = self.clock.now();
        let mut reg = self.lock();

        // Cancelled while running.
        let Some(job) = reg.jobs.get_mut(&handle) else {
            return;
        };

        let next = match outcome {
            JobOutcome::Cancel => None,
            JobOutcome::Continue => job.trigger.following_run(now),
        };

        match next {
            Some(next_run) => {
                job.next_run = next_run;
                job.callback = Some(callback);
                reg.queue.insert((next_run, handle));
            }
            None => {
                reg.jobs.remove(&handle);
                debug!(%handle, "Job retired");
            }
        }
    }

    /// Start the driver thread. Dropping or shutting down the returned
    /// handle stops it.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<SchedulerDriver> {
        let (tx, rx) = mpsc::channel::<DriverCmd>();
        let scheduler = Arc::clone(self);

        let join = std::thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || driver_loop(scheduler, rx))?;

        Ok(SchedulerDriver {
            tx,
            join: Some(join),
        })
    }

    /// How long the driver may sleep before the next pass.
    fn idle_for(&self) -> Duration {
        let now = self.clock.now();
        match self.next_due() {
            Some(at) if at <= now => Duration::ZERO,
            Some(at) => (at - now).to_std().unwrap_or(MAX_TICK).min(MAX_TICK),
            None => MAX_TICK,
        }
    }
}

enum DriverCmd {
    Shutdown,
}

/// Owner of the scheduler's driver thread.
pub struct SchedulerDriver {
    tx: mpsc::Sender<DriverCmd>,
    join: Option<JoinHandle<()>>,
}

impl SchedulerDriver {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.send(DriverCmd::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SchedulerDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn driver_loop(scheduler: Arc<Scheduler>, rx: mpsc::Receiver<DriverCmd>) {
    debug!("Scheduler driver started");
    loop {
        scheduler.run_pending();
        match rx.recv_timeout(scheduler.idle_for()) {
            Ok(DriverCmd::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
    }
    debug!("Scheduler driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M:%S").unwrap()
    }

    fn setup(start: &str) -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new(at(start)));
        let sched = Scheduler::new(clock.clone());
        (clock, sched)
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() -> JobOutcome + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
            JobOutcome::Continue
        })
    }

    #[test]
    fn next_daily_is_strictly_after_now() {
        let now = at("2024-03-04 07:45:00");
        assert_eq!(next_daily(now, t("07:45:00")), at("2024-03-05 07:45:00"));
        assert_eq!(next_daily(now, t("07:46:00")), at("2024-03-04 07:46:00"));
        assert_eq!(next_daily(now, t("00:01:00")), at("2024-03-05 00:01:00"));
    }

    #[test]
    fn daily_job_fires_once_per_day() {
        let (clock, sched) = setup("2024-03-04 07:00:00");
        let (count, cb) = counter();
        let h = sched.register_daily(t("07:45:00"), cb);

        assert_eq!(sched.run_pending(), 0);
        clock.set(at("2024-03-04 07:45:00"));
        assert_eq!(sched.run_pending(), 1);
        assert_eq!(sched.run_pending(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(sched.next_run(h), Some(at("2024-03-05 07:45:00")));

        clock.set(at("2024-03-05 07:45:01"));
        sched.run_pending();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn missed_daily_firings_are_not_replayed() {
        let (clock, sched) = setup("2024-03-04 07:00:00");
        let (count, cb) = counter();
        let h = sched.register_daily(t("07:45:00"), cb);

        // Three days pass between ticks: one late firing, then tomorrow.
        clock.set(at("2024-03-07 09:00:00"));
        sched.run_pending();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(sched.next_run(h), Some(at("2024-03-08 07:45:00")));
    }

    #[test]
    fn once_job_fires_then_retires() {
        let (clock, sched) = setup("2024-03-04 10:00:00");
        let (count, cb) = counter();
        let h = sched.register_once_at(t("10:05:00"), TimeDelta::minutes(1), cb);

        clock.set(at("2024-03-04 10:05:00"));
        sched.run_pending();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!sched.contains(h));
    }

    #[test]
    fn once_job_expires_without_firing() {
        let (clock, sched) = setup("2024-03-04 10:00:00");
        let (count, cb) = counter();
        let h = sched.register_once_at(t("10:05:00"), TimeDelta::minutes(1), cb);

        clock.set(at("2024-03-04 10:06:01"));
        sched.run_pending();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!sched.contains(h));
    }

    #[test]
    fn interval_job_cancels_itself() {
        let (clock, sched) = setup("2024-03-04 10:00:00");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let h = sched.register_interval(TimeDelta::seconds(30), move || {
            if f.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                JobOutcome::Cancel
            } else {
                JobOutcome::Continue
            }
        });

        clock.advance(TimeDelta::seconds(30));
        sched.run_pending();
        assert!(sched.contains(h));
        clock.advance(TimeDelta::seconds(30));
        sched.run_pending();
        assert!(!sched.contains(h));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_is_idempotent() {
        let (_clock, sched) = setup("2024-03-04 10:00:00");
        let (_count, cb) = counter();
        let h = sched.register_daily(t("11:00:00"), cb);
        assert!(sched.cancel(h));
        assert!(!sched.cancel(h));
        assert!(sched.is_empty());
    }

    #[test]
    fn cancel_tag_leaves_other_jobs_alone() {
        let (_clock, sched) = setup("2024-03-04 10:00:00");
        let (_a, cb_a) = counter();
        let (_b, cb_b) = counter();
        let (_c, cb_c) = counter();
        let keep = sched.register_daily(t("11:00:00"), cb_a);
        let at1 = at("2024-03-04 12:00:00");
        let expire_after = TimeDelta::minutes(1);
        sched.register(Trigger::Once { at: at1, expire_after }, Some("block"), cb_b);
        sched.register(Trigger::Once { at: at1, expire_after }, Some("block"), cb_c);

        assert_eq!(sched.tagged("block").len(), 2);
        assert_eq!(sched.cancel_tag("block"), 2);
        assert_eq!(sched.cancel_tag("block"), 0);
        assert!(sched.contains(keep));
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn simultaneous_jobs_run_in_registration_order() {
        let (clock, sched) = setup("2024-03-04 10:00:00");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let o = order.clone();
            sched.register_daily(t("10:30:00"), move || {
                o.lock().unwrap().push(i);
                JobOutcome::Continue
            });
        }
        clock.set(at("2024-03-04 10:30:00"));
        assert_eq!(sched.run_pending(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn callback_may_cancel_other_jobs_and_register_new_ones() {
        let (clock, sched) = setup("2024-03-04 10:00:00");
        let sched = Arc::new(sched);
        let (victim_count, victim_cb) = counter();
        let victim = sched.register_daily(t("10:30:00"), victim_cb);

        let s = Arc::clone(&sched);
        sched.register_daily(t("10:30:00"), move || {
            s.cancel(victim);
            s.register_interval(TimeDelta::seconds(5), || JobOutcome::Continue);
            JobOutcome::Cancel
        });

        clock.set(at("2024-03-04 10:30:00"));
        sched.run_pending();
        // The victim was registered first, so it ran before being cancelled.
        assert_eq!(victim_count.load(Ordering::SeqCst), 1);
        assert!(!sched.contains(victim));
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn cancel_during_run_drops_the_job() {
        let (clock, sched) = setup("2024-03-04 10:00:00");
        let sched = Arc::new(sched);
        let slot: Arc<Mutex<Option<JobHandle>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&sched);
        let sl = slot.clone();
        let h = sched.register_daily(t("10:30:00"), move || {
            if let Some(me) = *sl.lock().unwrap() {
                s.cancel(me);
            }
            JobOutcome::Continue
        });
        *slot.lock().unwrap() = Some(h);

        clock.set(at("2024-03-04 10:30:00"));
        sched.run_pending();
        assert!(!sched.contains(h));
    }

    #[test]
    fn panicking_callback_does_not_poison_scheduler() {
        let (clock, sched) = setup("2024-03-04 10:00:00");
        let h = sched.register_daily(t("10:30:00"), || panic!("boom"));
        let (count, cb) = counter();
        sched.register_daily(t("10:30:00"), cb);

        clock.set(at("2024-03-04 10:30:00"));
        assert_eq!(sched.run_pending(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(sched.contains(h));
    }

    #[test]
    fn next_due_tracks_earliest_job() {
        let (_clock, sched) = setup("2024-03-04 10:00:00");
        assert_eq!(sched.next_due(), None);
        sched.register_daily(t("12:00:00"), || JobOutcome::Continue);
        let early = sched.register_daily(t("11:00:00"), || JobOutcome::Continue);
        assert_eq!(sched.next_due(), Some(at("2024-03-04 11:00:00")));
        sched.cancel(early);
        assert_eq!(sched.next_due(), Some(at("2024-03-04 12:00:00")));
    }

    #[test]
    fn driver_thread_fires_due_jobs_and_shuts_down() {
        let clock = Arc::new(ManualClock::new(at("2024-03-04 10:00:00")));
        let sched = Arc::new(Scheduler::new(clock.clone()));
        let (count, cb) = counter();
        sched.register_interval(TimeDelta::seconds(1), cb);
        clock.advance(TimeDelta::seconds(1));

        let driver = sched.spawn().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while count.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        driver.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
