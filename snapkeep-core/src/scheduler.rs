/*!
Background scheduler that takes the automated daily snapshot.

One worker thread per [`Scheduler`]: each iteration asks the engine whether the
daily snapshot is due, creates it and applies retention, then sleeps until the
next computed wake time. The sleep waits on a condition variable so `stop`
interrupts it immediately. Failures inside an iteration (errors or panics) are
logged and retried after the configured failure backoff; they never end the
worker. A worker that outlives `stop`'s timeout stays registered until it
exits, so a second one is never spawned beside it.
*/

use crate::engine::SnapshotEngine;
use crate::repository::SnapshotRepository;
use crate::settings::SettingsProvider;
use crate::{Result, SnapshotError, SnapshotKind};
use chrono::{DateTime, Utc};
use snapkeep_retry::{FailureBackoff, RetryPolicy, DEFAULT_FAILURE_DELAY};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Wait after a failed iteration under the default policy
pub const FAILURE_RETRY_DELAY: Duration = DEFAULT_FAILURE_DELAY;
/// Wait between checks while automation is disabled
pub const DISABLED_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Longest single sleep, so clock or settings changes are noticed
pub const MAX_SLEEP: Duration = Duration::from_secs(60 * 60);
/// Shortest single sleep, so an overdue run never busy-spins
pub const MIN_SLEEP: Duration = Duration::from_secs(60);
/// How long `stop` waits for the worker to exit
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing knobs for the scheduler loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub max_sleep: Duration,
    pub min_sleep: Duration,
    pub disabled_poll_interval: Duration,
    pub stop_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_sleep: MAX_SLEEP,
            min_sleep: MIN_SLEEP,
            disabled_poll_interval: DISABLED_POLL_INTERVAL,
            stop_timeout: STOP_TIMEOUT,
            retry_policy: RetryPolicy::Fixed(FAILURE_RETRY_DELAY),
        }
    }
}

impl SchedulerOptions {
    /// Sleep before waking for a run due at `next`, clamped to `[min_sleep, max_sleep]`
    pub fn sleep_until(&self, next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let until = (next - now).to_std().unwrap_or(Duration::ZERO);
        until.min(self.max_sleep).max(self.min_sleep)
    }
}

/// One-shot flag that can be waited on with a timeout
#[derive(Debug, Default)]
struct Latch {
    set: Mutex<bool>,
    changed: Condvar,
}

impl Latch {
    fn set(&self) {
        match self.set.lock() {
            Ok(mut set) => *set = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        self.changed.notify_all();
    }

    fn is_set(&self) -> bool {
        self.set.lock().map(|s| *s).unwrap_or(true)
    }

    /// Block for up to `timeout`; true once the latch is set
    fn wait(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.set.lock() else {
            return true;
        };
        match self.changed.wait_timeout_while(guard, timeout, |set| !*set) {
            Ok((set, _)) => *set,
            Err(_) => true,
        }
    }
}

/// Sets the exit latch when the worker thread returns or unwinds
struct ExitNotice(Arc<Latch>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        self.0.set();
    }
}

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<Latch>,
    exited: Arc<Latch>,
}

impl Worker {
    fn has_exited(&self) -> bool {
        self.exited.is_set() || self.handle.is_finished()
    }
}

/// What the loop should do after an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    At(DateTime<Utc>),
    Disabled,
}

/// Owner of the background snapshot worker
///
/// Construct once at process startup and share by reference; `start` and
/// `stop` are safe to call from any thread.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use snapkeep_core::{Scheduler, SchedulerOptions, SnapshotEngine};
/// use snapkeep_core::repository::JsonFileRepository;
/// use snapkeep_core::settings::JsonFileSettings;
///
/// let engine = Arc::new(SnapshotEngine::new(
///     JsonFileRepository::new("/srv/app/snapshot_index.json"),
///     JsonFileSettings::new("/srv/app/settings.json"),
///     "/srv/app/app.db",
///     "/srv/app",
/// ));
/// let scheduler = Scheduler::new(engine, SchedulerOptions::default());
/// scheduler.start()?;
/// // ... serve requests ...
/// scheduler.stop();
/// # Ok::<(), snapkeep_core::SnapshotError>(())
/// ```
pub struct Scheduler<R, P>
where
    R: SnapshotRepository + 'static,
    P: SettingsProvider + 'static,
{
    engine: Arc<SnapshotEngine<R, P>>,
    options: SchedulerOptions,
    worker: Mutex<Option<Worker>>,
}

impl<R, P> Scheduler<R, P>
where
    R: SnapshotRepository + 'static,
    P: SettingsProvider + 'static,
{
    pub fn new(engine: Arc<SnapshotEngine<R, P>>, options: SchedulerOptions) -> Self {
        Self {
            engine,
            options,
            worker: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<SnapshotEngine<R, P>> {
        &self.engine
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    fn slot(&self) -> MutexGuard<'_, Option<Worker>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Spawn the worker unless one is already running
    ///
    /// # Returns
    /// `true` when a new worker was spawned, `false` when one was already running
    ///
    /// # Errors
    /// * `SnapshotError::Scheduler` - A stopped worker has not exited yet, or
    ///   the thread could not be spawned
    pub fn start(&self) -> Result<bool> {
        let mut slot = self.slot();

        if let Some(existing) = slot.as_ref() {
            if !existing.has_exited() {
                if existing.stop.is_set() {
                    return Err(SnapshotError::Scheduler(
                        "previous worker is still shutting down".into(),
                    ));
                }
                debug!("Snapshot scheduler already running");
                return Ok(false);
            }
        }
        if let Some(finished) = slot.take() {
            if finished.handle.join().is_err() {
                warn!("Previous scheduler worker had panicked");
            }
        }

        let stop = Arc::new(Latch::default());
        let exited = Arc::new(Latch::default());
        let engine = Arc::clone(&self.engine);
        let options = self.options.clone();
        let (thread_stop, thread_exited) = (Arc::clone(&stop), Arc::clone(&exited));

        let handle = thread::Builder::new()
            .name("snapkeep-scheduler".into())
            .spawn(move || {
                let _notice = ExitNotice(thread_exited);
                run_loop(&engine, &options, &thread_stop);
            })
            .map_err(|e| SnapshotError::Scheduler(format!("failed to spawn worker: {e}")))?;

        *slot = Some(Worker {
            handle,
            stop,
            exited,
        });
        info!(retry_policy = %self.options.retry_policy, "Snapshot scheduler started");
        Ok(true)
    }

    /// Signal the worker to exit and wait up to `stop_timeout` for it
    ///
    /// The worker lock is not held while waiting.
    ///
    /// # Returns
    /// `true` when no worker is left running, `false` when the worker is still
    /// finishing its iteration. It stays registered in that case and `start`
    /// refuses to spawn another until it has exited.
    pub fn stop(&self) -> bool {
        let (stop, exited) = match self.slot().as_ref() {
            Some(worker) => (Arc::clone(&worker.stop), Arc::clone(&worker.exited)),
            None => return true,
        };

        stop.set();
        if !exited.wait(self.options.stop_timeout) {
            warn!(
                timeout_secs = self.options.stop_timeout.as_secs_f64(),
                "Scheduler worker did not stop in time; it exits after its current iteration"
            );
            return false;
        }

        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|w| Arc::ptr_eq(&w.exited, &exited)) {
            if let Some(worker) = slot.take() {
                if worker.handle.join().is_err() {
                    warn!("Scheduler worker panicked while stopping");
                }
            }
        }
        info!("Snapshot scheduler stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.slot().as_ref().is_some_and(|w| !w.has_exited())
    }
}

impl<R, P> Drop for Scheduler<R, P>
where
    R: SnapshotRepository + 'static,
    P: SettingsProvider + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_iteration<R, P>(engine: &SnapshotEngine<R, P>, now: DateTime<Utc>) -> Result<Wake>
where
    R: SnapshotRepository,
    P: SettingsProvider,
{
    if engine.should_run_automated(now)? {
        let snapshot = engine.create_at(SnapshotKind::automated_daily(), None, None, false, now)?;
        let deleted = engine.enforce_retention()?;
        info!(
            snapshot_id = %snapshot.id,
            size_bytes = snapshot.size_bytes,
            deleted,
            "Automated daily snapshot complete"
        );
    }

    let next = engine.next_scheduled_run(Utc::now())?;
    Ok(if next.enabled {
        Wake::At(next.at)
    } else {
        Wake::Disabled
    })
}

fn run_loop<R, P>(engine: &SnapshotEngine<R, P>, options: &SchedulerOptions, stop: &Latch)
where
    R: SnapshotRepository,
    P: SettingsProvider,
{
    let mut backoff = FailureBackoff::new(options.retry_policy);

    while !stop.is_set() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_iteration(engine, Utc::now())));

        let wait = match outcome {
            Ok(Ok(Wake::At(next))) => {
                backoff.reset();
                let wait = options.sleep_until(next, Utc::now());
                debug!(next_run = %next, sleep_secs = wait.as_secs_f64(), "Scheduler sleeping");
                wait
            }
            Ok(Ok(Wake::Disabled)) => {
                backoff.reset();
                debug!("Automated snapshots disabled");
                options.disabled_poll_interval
            }
            Ok(Err(e)) => {
                let delay = backoff.next_delay();
                error!(
                    error = %e,
                    error_kind = %e.kind(),
                    consecutive_failures = backoff.consecutive_failures(),
                    retry_in_secs = delay.as_secs_f64(),
                    "Scheduled snapshot iteration failed"
                );
                delay
            }
            Err(payload) => {
                let delay = backoff.next_delay();
                error!(
                    panic = %panic_message(payload.as_ref()),
                    consecutive_failures = backoff.consecutive_failures(),
                    retry_in_secs = delay.as_secs_f64(),
                    "Scheduled snapshot iteration panicked"
                );
                delay
            }
        };

        if stop.wait(wait) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KEY_AUTO_ENABLED, KEY_DAILY_TIME};
    use crate::repository::MemoryRepository;
    use crate::settings::{MemorySettings, SettingValue};
    use crate::Snapshot;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tempfile::TempDir;

    fn fast_options() -> SchedulerOptions {
        SchedulerOptions {
            max_sleep: Duration::from_millis(50),
            min_sleep: Duration::from_millis(10),
            disabled_poll_interval: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::Fixed(Duration::from_millis(20)),
        }
    }

    fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    fn automated_count<R: SnapshotRepository>(repo: &R) -> usize {
        repo.list()
            .unwrap()
            .iter()
            .filter(|s| s.kind.is_automated())
            .count()
    }

    fn engine_in(
        dir: &TempDir,
        settings: MemorySettings,
    ) -> Arc<SnapshotEngine<MemoryRepository, MemorySettings>> {
        Arc::new(SnapshotEngine::new(
            MemoryRepository::new(),
            settings,
            dir.path().join("app.db"),
            dir.path(),
        ))
    }

    #[test]
    fn test_sleep_is_clamped() {
        let options = SchedulerOptions::default();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        // Overdue never busy-spins.
        assert_eq!(options.sleep_until(now - chrono::Duration::hours(3), now), MIN_SLEEP);
        assert_eq!(options.sleep_until(now + chrono::Duration::seconds(5), now), MIN_SLEEP);
        assert_eq!(
            options.sleep_until(now + chrono::Duration::minutes(10), now),
            Duration::from_secs(600)
        );
        assert_eq!(options.sleep_until(now + chrono::Duration::hours(14), now), MAX_SLEEP);
    }

    #[test]
    fn test_start_is_idempotent_and_stop_joins() {
        let dir = TempDir::new().unwrap();
        let settings = MemorySettings::new().with(KEY_AUTO_ENABLED, SettingValue::Bool(false));
        let scheduler = Scheduler::new(engine_in(&dir, settings), fast_options());

        assert!(scheduler.start().unwrap());
        assert!(!scheduler.start().unwrap());
        assert!(scheduler.is_running());

        assert!(scheduler.stop());
        assert!(!scheduler.is_running());
        assert!(scheduler.stop());

        // Restartable after a stop.
        assert!(scheduler.start().unwrap());
        assert!(scheduler.stop());
    }

    #[test]
    fn test_concurrent_starts_spawn_one_worker() {
        let dir = TempDir::new().unwrap();
        let settings = MemorySettings::new().with(KEY_AUTO_ENABLED, SettingValue::Bool(false));
        let scheduler = Arc::new(Scheduler::new(engine_in(&dir, settings), fast_options()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || scheduler.start().unwrap())
            })
            .collect();
        let started = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|started| *started)
            .count();

        assert_eq!(started, 1);
        assert!(scheduler.stop());
    }

    #[test]
    fn test_takes_exactly_one_daily_snapshot() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.db"), b"records").unwrap();
        let settings = MemorySettings::new().with(KEY_DAILY_TIME, SettingValue::Str("00:00".into()));
        let engine = engine_in(&dir, settings);
        let scheduler = Scheduler::new(Arc::clone(&engine), fast_options());

        scheduler.start().unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            automated_count(engine.repository()) == 1
        }));

        // Several more wake cycles must not add a second one.
        thread::sleep(Duration::from_millis(200));
        assert_eq!(automated_count(engine.repository()), 1);
        assert!(scheduler.stop());

        let snapshot = &engine.list().unwrap()[0];
        assert_eq!(snapshot.created_by, None);
        assert_eq!(snapshot.kind, SnapshotKind::automated_daily());
    }

    #[test]
    fn test_recovers_after_failed_iteration() {
        let dir = TempDir::new().unwrap();
        let settings = MemorySettings::new().with(KEY_DAILY_TIME, SettingValue::Str("00:00".into()));
        let engine = engine_in(&dir, settings);
        let scheduler = Scheduler::new(Arc::clone(&engine), fast_options());

        // No data file yet: every iteration fails with NotFound.
        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(scheduler.is_running());
        assert_eq!(automated_count(engine.repository()), 0);

        std::fs::write(dir.path().join("app.db"), b"late data").unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            automated_count(engine.repository()) == 1
        }));
        assert!(scheduler.stop());
    }

    #[test]
    fn test_stop_interrupts_long_sleep() {
        let dir = TempDir::new().unwrap();
        let settings = MemorySettings::new().with(KEY_AUTO_ENABLED, SettingValue::Bool(false));
        let options = SchedulerOptions {
            disabled_poll_interval: Duration::from_secs(3600),
            ..fast_options()
        };
        let scheduler = Scheduler::new(engine_in(&dir, settings), options);

        scheduler.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(scheduler.stop());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    /// Settings whose every lookup is slow, counting overlapping readers
    struct SlowSettings {
        inner: MemorySettings,
        delay: Duration,
        reads: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowSettings {
        fn new(inner: MemorySettings, delay: Duration) -> Self {
            Self {
                inner,
                delay,
                reads: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl SettingsProvider for SlowSettings {
        fn get(&self, key: &str) -> Option<SettingValue> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: SettingValue, actor: Option<&str>) -> Result<()> {
            self.inner.set(key, value, actor)
        }
    }

    fn slow_engine(
        dir: &TempDir,
        delay: Duration,
    ) -> Arc<SnapshotEngine<MemoryRepository, SlowSettings>> {
        let settings = MemorySettings::new().with(KEY_AUTO_ENABLED, SettingValue::Bool(false));
        Arc::new(SnapshotEngine::new(
            MemoryRepository::new(),
            SlowSettings::new(settings, delay),
            dir.path().join("app.db"),
            dir.path(),
        ))
    }

    #[test]
    fn test_timed_out_stop_keeps_worker_until_it_exits() {
        let dir = TempDir::new().unwrap();
        let engine = slow_engine(&dir, Duration::from_millis(100));
        let options = SchedulerOptions {
            stop_timeout: Duration::from_millis(20),
            ..fast_options()
        };
        let scheduler = Scheduler::new(Arc::clone(&engine), options);

        assert!(scheduler.start().unwrap());
        assert!(wait_for(Duration::from_secs(5), || {
            engine.settings().reads.load(Ordering::SeqCst) >= 1
        }));

        // Mid-iteration: the worker cannot exit within 20ms.
        assert!(!scheduler.stop());
        assert!(scheduler.is_running());
        assert!(matches!(scheduler.start(), Err(SnapshotError::Scheduler(_))));

        assert!(wait_for(Duration::from_secs(10), || !scheduler.is_running()));
        assert!(scheduler.start().unwrap());
        assert!(wait_for(Duration::from_secs(10), || scheduler.stop()));

        assert_eq!(engine.settings().peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_is_running_answers_while_stop_waits() {
        let dir = TempDir::new().unwrap();
        let engine = slow_engine(&dir, Duration::from_millis(100));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&engine), fast_options()));

        scheduler.start().unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            engine.settings().reads.load(Ordering::SeqCst) >= 1
        }));

        let stopper = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.stop())
        };
        thread::sleep(Duration::from_millis(20));

        let asked = Instant::now();
        assert!(scheduler.is_running());
        assert!(asked.elapsed() < Duration::from_millis(50));

        assert!(stopper.join().unwrap());
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_iteration_stamps_the_instant_it_checked() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.db"), b"records").unwrap();
        let settings = MemorySettings::new().with(KEY_DAILY_TIME, SettingValue::Str("00:00".into()));
        let engine = engine_in(&dir, settings);

        // Checked one second before midnight; the copy finishes after it.
        let yesterday = (Utc::now() - chrono::Duration::days(1)).date_naive();
        let checked_at = yesterday.and_hms_opt(23, 59, 59).unwrap().and_utc();
        run_iteration(&engine, checked_at).unwrap();

        let snapshots = engine.list().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].created_at, checked_at);
        assert!(engine.has_automated_on(yesterday).unwrap());

        let today_noon = yesterday.succ_opt().unwrap().and_hms_opt(12, 0, 0).unwrap().and_utc();
        assert!(engine.should_run_automated(today_noon).unwrap());
    }

    mockall::mock! {
        Repo {}
        impl SnapshotRepository for Repo {
            fn insert(&self, snapshot: &Snapshot) -> Result<()>;
            fn list(&self) -> Result<Vec<Snapshot>>;
            fn get(&self, id: &str) -> Result<Option<Snapshot>>;
            fn delete(&self, id: &str) -> Result<()>;
            fn set_retained(&self, id: &str, retained: bool) -> Result<Option<Snapshot>>;
        }
    }

    #[test]
    fn test_repository_errors_do_not_kill_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut repo = MockRepo::new();
        repo.expect_list().returning(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(SnapshotError::repository("index unavailable"))
        });
        repo.expect_insert().never();

        let engine = Arc::new(SnapshotEngine::new(
            repo,
            MemorySettings::new().with(KEY_DAILY_TIME, SettingValue::Str("00:00".into())),
            PathBuf::from("/nonexistent/app.db"),
            PathBuf::from("/nonexistent"),
        ));
        let scheduler = Scheduler::new(engine, fast_options());

        scheduler.start().unwrap();
        assert!(wait_for(Duration::from_secs(5), || {
            calls.load(Ordering::SeqCst) >= 3
        }));
        assert!(scheduler.is_running());
        assert!(scheduler.stop());
    }
}
