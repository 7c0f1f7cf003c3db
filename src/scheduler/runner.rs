//! Scheduler background loop.
//!
//! Periodically checks enabled tasks and emits `task:due` once an
//! occurrence's time has come and `task:overdue` once it is more than the
//! grace period late without a completion. Each occurrence is announced at
//! most once per event kind, tracked by occurrence keys in two bounded
//! dedup sets (optionally persisted through an [`OccurrenceLedger`]).
//!
//! On startup a recovery pass announces occurrences missed while the
//! process was down and moves stale due dates forward.

use crate::config::{CadenceConfig, SchedulerConfig};
use crate::error::{CadenceError, Result};
use crate::recurrence::{RecurrenceEngine, RuleCache, TimezoneHandler};
use crate::scheduler::dedup::{DedupSet, KeyPrecision, OccurrenceKey};
use crate::scheduler::events::{EventBus, EventContext, EventKind, Subscription, TaskEvent};
use crate::scheduler::ledger::{LedgerSnapshot, OccurrenceLedger};
use crate::scheduler::store::{TaskStore, TimestampStore};
use crate::scheduler::task::Task;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default rule cache size when no engine is supplied.
const DEFAULT_RULE_CACHE_SIZE: usize = 256;

/// Outcome of one due/overdue check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// `task:due` events emitted.
    pub due: usize,
    /// `task:overdue` events emitted.
    pub overdue: usize,
    /// `true` when another check was already running and this one did nothing.
    pub skipped: bool,
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// No last-run timestamp existed; only `now` was recorded.
    pub first_run: bool,
    /// Tasks examined.
    pub tasks: usize,
    /// `task:overdue` events emitted for missed occurrences.
    pub overdue: usize,
    /// Tasks whose due date was moved forward.
    pub advanced: usize,
    /// Tasks whose recovery failed and was skipped.
    pub failed: usize,
}

struct DedupState {
    due: DedupSet,
    overdue: DedupSet,
}

struct Inner {
    tasks: Arc<dyn TaskStore>,
    timestamps: Arc<dyn TimestampStore>,
    engine: RecurrenceEngine,
    config: SchedulerConfig,
    cache_max_age: Option<Duration>,
    events: EventBus,
    dedup: Mutex<DedupState>,
    ledger: Option<OccurrenceLedger>,
    /// Last value written under the last-run key by this process.
    last_run_mark: Mutex<Option<DateTime<Utc>>>,
    checking: AtomicBool,
    check_generation: AtomicU64,
    check_started: Mutex<Option<Instant>>,
    running: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Releases the reentrancy flag unless a newer check has taken over.
struct CheckGuard<'a> {
    inner: &'a Inner,
    generation: u64,
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        if self.inner.check_generation.load(Ordering::SeqCst) == self.generation {
            *lock(&self.inner.check_started) = None;
            self.inner.checking.store(false, Ordering::SeqCst);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    tasks: Arc<dyn TaskStore>,
    timestamps: Arc<dyn TimestampStore>,
    config: SchedulerConfig,
    engine: Option<RecurrenceEngine>,
    ledger: Option<OccurrenceLedger>,
    cache_max_age: Option<Duration>,
}

impl SchedulerBuilder {
    /// Scheduler timing and bookkeeping settings.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Recurrence engine used to advance due dates.
    pub fn with_engine(mut self, engine: RecurrenceEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Persist announced occurrence keys to `ledger`.
    pub fn with_ledger(mut self, ledger: OccurrenceLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Apply a full configuration: scheduler settings, timezone and rule
    /// cache. An engine set earlier is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Config`] for an unknown timezone or a zero
    /// cache size.
    pub fn with_cadence_config(mut self, config: &CadenceConfig) -> Result<Self> {
        let tz = TimezoneHandler::from_name(&config.timezone)?;
        let cache = Arc::new(RuleCache::new(config.cache.max_size)?);
        self.engine = Some(RecurrenceEngine::new(tz, cache));
        self.cache_max_age = Some(config.cache.max_age());
        self.config = config.scheduler.clone();
        Ok(self)
    }

    /// Finish construction, loading the ledger if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`CadenceError::Store`] if an existing ledger cannot be read.
    pub fn build(self) -> Result<Scheduler> {
        let engine = match self.engine {
            Some(engine) => engine,
            None => RecurrenceEngine::new(
                TimezoneHandler::utc(),
                Arc::new(RuleCache::new(DEFAULT_RULE_CACHE_SIZE)?),
            ),
        };
        let ledger = self
            .ledger
            .or_else(|| self.config.ledger_path.clone().map(OccurrenceLedger::new));

        let capacity = self.config.dedup_capacity;
        let dedup = match &ledger {
            Some(ledger) => {
                let snapshot = ledger.load()?;
                debug!(
                    due = snapshot.due.len(),
                    overdue = snapshot.overdue.len(),
                    "loaded occurrence ledger from {}",
                    ledger.path().display()
                );
                DedupState {
                    due: DedupSet::from_keys(capacity, snapshot.due),
                    overdue: DedupSet::from_keys(capacity, snapshot.overdue),
                }
            }
            None => DedupState {
                due: DedupSet::new(capacity),
                overdue: DedupSet::new(capacity),
            },
        };

        Ok(Scheduler {
            inner: Arc::new(Inner {
                tasks: self.tasks,
                timestamps: self.timestamps,
                engine,
                config: self.config,
                cache_max_age: self.cache_max_age,
                events: EventBus::new(),
                dedup: Mutex::new(dedup),
                ledger,
                last_run_mark: Mutex::new(None),
                checking: AtomicBool::new(false),
                check_generation: AtomicU64::new(0),
                check_started: Mutex::new(None),
                running: AtomicBool::new(false),
                cancel: Mutex::new(None),
                loop_handle: Mutex::new(None),
            }),
        })
    }
}

/// Due/overdue detector for recurring tasks. Cloning yields another handle
/// to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Scheduler {
    /// Start building a scheduler over the given stores.
    pub fn builder(
        tasks: Arc<dyn TaskStore>,
        timestamps: Arc<dyn TimestampStore>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            tasks,
            timestamps,
            config: SchedulerConfig::default(),
            engine: None,
            ledger: None,
            cache_max_age: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &RecurrenceEngine {
        &self.inner.engine
    }

    /// `true` between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register a listener for `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&TaskEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    /// Receive events of `kind` on a channel.
    pub fn subscribe(&self, kind: EventKind) -> mpsc::UnboundedReceiver<TaskEvent> {
        self.inner.events.subscribe(kind)
    }

    /// Sizes of the due and overdue dedup sets.
    pub fn dedup_sizes(&self) -> (usize, usize) {
        let dedup = lock(&self.inner.dedup);
        (dedup.due.len(), dedup.overdue.len())
    }

    /// Drop the compiled custom rules cached for `task_id`; call after
    /// changing a task's frequency. Returns how many entries were removed.
    pub fn invalidate_task_rules(&self, task_id: &str) -> usize {
        self.inner
            .engine
            .cache()
            .invalidate_for_owner(&format!("{task_id}:"))
    }

    // -- lifecycle ---------------------------------------------------------

    /// Recover (if configured), run one check immediately, then keep checking
    /// on interval boundaries in a background task until [`stop`](Self::stop).
    ///
    /// Calling `start` on a running scheduler does nothing.
    ///
    /// # Errors
    ///
    /// Recovery and the first check log their failures rather than returning
    /// them; the `Result` is reserved for startup failures.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("scheduler already running");
            return Ok(());
        }

        if self.inner.config.recover_on_start
            && let Err(e) = self.recover_missed_tasks().await
        {
            warn!("recovery pass failed: {e}");
        }
        if let Err(e) = self.run_once().await {
            warn!("initial check failed: {e}");
        }

        // stop() may have been called while the initial pass was running.
        if !self.is_running() {
            return Ok(());
        }

        let token = CancellationToken::new();
        *lock(&self.inner.cancel) = Some(token.clone());
        let scheduler = self.clone();
        let handle = tokio::spawn(async move { scheduler.run_loop(token).await });
        *lock(&self.inner.loop_handle) = Some(handle);

        info!(
            interval_secs = self.inner.config.check_interval().as_secs(),
            "scheduler started"
        );
        Ok(())
    }

    /// Stop scheduling further checks. A check already in progress finishes.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = lock(&self.inner.cancel).take() {
            token.cancel();
        }
        lock(&self.inner.loop_handle).take();
        info!("scheduler stopped");
    }

    async fn run_loop(self, cancel: CancellationToken) {
        let interval = self.inner.config.check_interval();
        loop {
            let delay = delay_until_next_boundary(Utc::now(), interval);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("scheduler loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.run_once().await {
                        warn!("scheduled check failed: {e}");
                    }
                    if let Some(max_age) = self.inner.cache_max_age {
                        self.inner.engine.cache().prune_old(max_age);
                    }
                }
            }
        }
    }

    // -- checks ------------------------------------------------------------

    /// Check all enabled tasks against the current time.
    ///
    /// # Errors
    ///
    /// Returns the task store's error if tasks cannot be listed.
    pub async fn run_once(&self) -> Result<TickReport> {
        self.run_once_at(Utc::now()).await
    }

    /// Check all enabled tasks against `now`.
    ///
    /// # Errors
    ///
    /// See [`run_once`](Self::run_once).
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let Some(_guard) = self.inner.begin_check() else {
            debug!("check already in progress, skipping");
            return Ok(TickReport {
                skipped: true,
                ..TickReport::default()
            });
        };

        let tasks = self.inner.tasks.enabled_tasks().await?;
        let grace = self.inner.config.grace_period();
        let precision = self.inner.config.key_precision;
        let mut report = TickReport::default();

        for task in tasks {
            if task.due_at > now {
                continue;
            }

            let due_key = OccurrenceKey::new(&task.id, task.due_at, precision);
            if self.inner.record(EventKind::Due, due_key) {
                self.inner
                    .emit(EventKind::Due, EventContext::Today, task.due_at, &task);
                report.due += 1;
            }

            if now - task.due_at < grace {
                continue;
            }
            let overdue_key = OccurrenceKey::new(&task.id, task.due_at, precision);
            if self.inner.is_recorded(EventKind::Overdue, &overdue_key) {
                continue;
            }
            // A due listener may have completed or moved the task.
            let mut current = match self.inner.tasks.get_task(&task.id).await {
                Ok(Some(current)) if current.enabled && current.due_at == task.due_at => current,
                Ok(_) => {
                    debug!(task_id = %task.id, "task changed during check, skipping overdue");
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task.id, "cannot reload task: {e}");
                    continue;
                }
            };
            if current.completed_since(current.due_at)
                || !self.inner.record(EventKind::Overdue, overdue_key)
            {
                continue;
            }
            current.miss_count = current.miss_count.saturating_add(1);
            current.streak = 0;
            if let Err(e) = self.inner.tasks.save_task(&current).await {
                warn!(task_id = %current.id, "cannot record missed occurrence: {e}");
            }
            self.inner.emit(
                EventKind::Overdue,
                EventContext::Overdue,
                current.due_at,
                &current,
            );
            report.overdue += 1;
        }

        self.inner.finish_pass(report.due + report.overdue > 0).await;
        // Occurrences older than the grace period have had their overdue
        // check; recovery after a restart resumes from there.
        if let Some(mark) = now.checked_sub_signed(grace) {
            self.inner.advance_last_run(mark).await;
        }
        if report.due + report.overdue > 0 {
            debug!(due = report.due, overdue = report.overdue, "check complete");
        }
        Ok(report)
    }

    // -- recovery ----------------------------------------------------------

    /// Announce occurrences missed while the process was not running and move
    /// stale due dates forward. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns store errors for the last-run timestamp or the task listing.
    /// Failures for individual tasks are logged and counted instead.
    pub async fn recover_missed_tasks(&self) -> Result<RecoveryReport> {
        self.recover_missed_tasks_at(Utc::now()).await
    }

    /// [`recover_missed_tasks`](Self::recover_missed_tasks) against `now`.
    ///
    /// # Errors
    ///
    /// See [`recover_missed_tasks`](Self::recover_missed_tasks).
    pub async fn recover_missed_tasks_at(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let key = self.inner.config.last_run_key.as_str();
        let Some(last_run) = self.inner.timestamps.load(key).await? else {
            self.inner.timestamps.save(key, now).await?;
            *lock(&self.inner.last_run_mark) = Some(now);
            info!("no previous run recorded, skipping recovery");
            return Ok(RecoveryReport {
                first_run: true,
                ..RecoveryReport::default()
            });
        };

        let tasks = self.inner.tasks.enabled_tasks().await?;
        let mut report = RecoveryReport {
            tasks: tasks.len(),
            ..RecoveryReport::default()
        };
        for task in tasks {
            let task_id = task.id.clone();
            match self.recover_task(task, last_run, now).await {
                Ok((overdue, advanced)) => {
                    report.overdue += overdue;
                    report.advanced += usize::from(advanced);
                }
                Err(e) => {
                    warn!(task_id = %task_id, "recovery failed for task: {e}");
                    report.failed += 1;
                }
            }
        }

        self.inner.finish_pass(report.overdue > 0).await;
        self.inner.timestamps.save(key, now).await?;
        *lock(&self.inner.last_run_mark) = Some(now);
        info!(
            since = %last_run,
            overdue = report.overdue,
            advanced = report.advanced,
            failed = report.failed,
            "recovery pass complete"
        );
        Ok(report)
    }

    async fn recover_task(
        &self,
        mut task: Task,
        last_run: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(usize, bool)> {
        let engine = &self.inner.engine;
        let missed = engine.missed_occurrences_for(
            &task.id,
            task.created_at,
            last_run,
            now,
            &task.frequency,
            task.due_at,
        )?;

        let precision = self.inner.config.key_precision;
        let mut tick_keys = Vec::new();
        let mut emitted = 0;
        for occurrence in missed {
            if task.completed_since(occurrence) {
                continue;
            }
            // A tick may already have announced this occurrence under its
            // own key precision.
            let tick_key = OccurrenceKey::new(&task.id, occurrence, precision);
            if self.inner.is_recorded(EventKind::Overdue, &tick_key) {
                continue;
            }
            let key = OccurrenceKey::new(&task.id, occurrence, KeyPrecision::Exact);
            if self.inner.record(EventKind::Overdue, key) {
                task.miss_count = task.miss_count.saturating_add(1);
                task.streak = 0;
                self.inner
                    .emit(EventKind::Overdue, EventContext::Overdue, occurrence, &task);
                emitted += 1;
                tick_keys.push(tick_key);
            }
        }
        // Recorded after the loop so occurrences sharing an hour are all announced.
        for key in tick_keys {
            self.inner.record(EventKind::Overdue, key);
        }

        let original_due = task.due_at;
        let max_advances = self.inner.config.max_recovery_advances;
        let mut advances = 0;
        while task.due_at < now && advances < max_advances {
            match engine.calculate_next_anchored(
                &task.id,
                task.created_at,
                task.due_at,
                &task.frequency,
            )? {
                Some(next) => task.due_at = next,
                None => {
                    info!(task_id = %task.id, "recurrence has ended, disabling task");
                    task.enabled = false;
                    break;
                }
            }
            advances += 1;
        }
        if task.enabled && task.due_at < now {
            warn!(
                task_id = %task.id,
                advances,
                "due date still in the past after the advance limit"
            );
        }

        let advanced = task.due_at != original_due;
        if !advanced && emitted == 0 && task.enabled {
            return Ok((0, false));
        }

        // Listeners ran in between; apply the recovery changes to the stored
        // task rather than overwriting it with the snapshot.
        let Some(mut current) = self.inner.tasks.get_task(&task.id).await? else {
            return Ok((emitted, false));
        };
        if current.due_at != original_due {
            debug!(task_id = %task.id, "task changed during recovery, keeping its new state");
            return Ok((emitted, false));
        }
        current.due_at = task.due_at;
        current.enabled = task.enabled;
        if emitted > 0 {
            current.miss_count = current
                .miss_count
                .saturating_add(u32::try_from(emitted).unwrap_or(u32::MAX));
            current.streak = 0;
        }
        self.inner.tasks.save_task(&current).await?;
        Ok((emitted, advanced))
    }

    // -- mutations ---------------------------------------------------------

    /// Record a completion and move the task to its next occurrence after now.
    ///
    /// # Errors
    ///
    /// [`CadenceError::TaskNotFound`] for unknown ids, plus engine and store
    /// errors.
    pub async fn mark_task_done(&self, task_id: &str) -> Result<Task> {
        self.mark_task_done_at(task_id, Utc::now()).await
    }

    /// [`mark_task_done`](Self::mark_task_done) against `now`.
    ///
    /// # Errors
    ///
    /// See [`mark_task_done`](Self::mark_task_done).
    pub async fn mark_task_done_at(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let mut task = self.load_task(task_id).await?;
        let on_time = now - task.due_at < self.inner.config.grace_period();

        task.last_completed_at = Some(now);
        task.completion_count = task.completion_count.saturating_add(1);
        task.streak = if on_time {
            task.streak.saturating_add(1)
        } else {
            0
        };
        task.snooze_count = 0;
        self.advance_past(&mut task, now)?;

        self.inner.tasks.save_task(&task).await?;
        debug!(task_id, next = %task.due_at, "task completed");
        Ok(task)
    }

    /// Push the due date `minutes` into the future.
    ///
    /// # Errors
    ///
    /// [`CadenceError::InvalidArgument`] when `minutes` is zero,
    /// [`CadenceError::TaskNotFound`] for unknown ids.
    pub async fn delay_task(&self, task_id: &str, minutes: u32) -> Result<Task> {
        self.delay_task_at(task_id, minutes, Utc::now()).await
    }

    /// [`delay_task`](Self::delay_task) against `now`.
    ///
    /// # Errors
    ///
    /// See [`delay_task`](Self::delay_task).
    pub async fn delay_task_at(
        &self,
        task_id: &str,
        minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        if minutes == 0 {
            return Err(CadenceError::InvalidArgument(
                "delay must be at least one minute".to_owned(),
            ));
        }
        let mut task = self.load_task(task_id).await?;
        task.due_at = now
            .checked_add_signed(chrono::Duration::minutes(i64::from(minutes)))
            .ok_or_else(|| {
                CadenceError::InvalidArgument(format!("delay of {minutes} minutes is out of range"))
            })?;
        task.snooze_count = task.snooze_count.saturating_add(1);
        self.inner.tasks.save_task(&task).await?;
        debug!(task_id, minutes, "task delayed");
        Ok(task)
    }

    /// Move the task to tomorrow at its current local clock time.
    ///
    /// # Errors
    ///
    /// [`CadenceError::TaskNotFound`] for unknown ids.
    pub async fn delay_to_tomorrow(&self, task_id: &str) -> Result<Task> {
        self.delay_to_tomorrow_at(task_id, Utc::now()).await
    }

    /// [`delay_to_tomorrow`](Self::delay_to_tomorrow) against `now`.
    ///
    /// # Errors
    ///
    /// See [`delay_to_tomorrow`](Self::delay_to_tomorrow).
    pub async fn delay_to_tomorrow_at(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let mut task = self.load_task(task_id).await?;
        task.due_at = self
            .inner
            .engine
            .timezone()
            .tomorrow_same_time(task.due_at, now)
            .ok_or_else(|| CadenceError::InvalidArgument("tomorrow is out of range".to_owned()))?;
        task.snooze_count = task.snooze_count.saturating_add(1);
        self.inner.tasks.save_task(&task).await?;
        debug!(task_id, due = %task.due_at, "task delayed to tomorrow");
        Ok(task)
    }

    /// Skip the current occurrence without completing it.
    ///
    /// # Errors
    ///
    /// [`CadenceError::TaskNotFound`] for unknown ids, plus engine and store
    /// errors.
    pub async fn skip_occurrence(&self, task_id: &str) -> Result<Task> {
        self.skip_occurrence_at(task_id, Utc::now()).await
    }

    /// [`skip_occurrence`](Self::skip_occurrence) against `now`.
    ///
    /// # Errors
    ///
    /// See [`skip_occurrence`](Self::skip_occurrence).
    pub async fn skip_occurrence_at(&self, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
        let mut task = self.load_task(task_id).await?;
        task.skip_count = task.skip_count.saturating_add(1);
        task.streak = 0;
        task.snooze_count = 0;
        self.advance_past(&mut task, now)?;
        self.inner.tasks.save_task(&task).await?;
        debug!(task_id, next = %task.due_at, "occurrence skipped");
        Ok(task)
    }

    async fn load_task(&self, task_id: &str) -> Result<Task> {
        self.inner
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| CadenceError::TaskNotFound(task_id.to_owned()))
    }

    /// Advance at least once, then until the due date is after `now`.
    /// Disables the task when its series ends.
    fn advance_past(&self, task: &mut Task, now: DateTime<Utc>) -> Result<()> {
        let max_advances = self.inner.config.max_recovery_advances.max(1);
        for _ in 0..max_advances {
            match self.inner.engine.calculate_next_anchored(
                &task.id,
                task.created_at,
                task.due_at,
                &task.frequency,
            )? {
                Some(next) => task.due_at = next,
                None => {
                    info!(task_id = %task.id, "recurrence has ended, disabling task");
                    task.enabled = false;
                    return Ok(());
                }
            }
            if task.due_at > now {
                return Ok(());
            }
        }
        warn!(task_id = %task.id, "due date still in the past after the advance limit");
        Ok(())
    }
}

impl Inner {
    /// Enter a check, force-resetting a check that has been running longer
    /// than the stuck timeout.
    fn begin_check(&self) -> Option<CheckGuard<'_>> {
        if self
            .checking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started = *lock(&self.check_started);
            let stuck = started.is_some_and(|s| s.elapsed() >= self.config.stuck_check_timeout());
            if !stuck {
                return None;
            }
            warn!("previous check appears stuck, force-resetting");
        }
        let generation = self.check_generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.check_started) = Some(Instant::now());
        Some(CheckGuard {
            inner: self,
            generation,
        })
    }

    fn is_recorded(&self, kind: EventKind, key: &OccurrenceKey) -> bool {
        let dedup = lock(&self.dedup);
        match kind {
            EventKind::Due => dedup.due.contains(key),
            EventKind::Overdue => dedup.overdue.contains(key),
        }
    }

    /// Insert `key` into the set for `kind`; `false` if already announced.
    fn record(&self, kind: EventKind, key: OccurrenceKey) -> bool {
        let mut dedup = lock(&self.dedup);
        match kind {
            EventKind::Due => dedup.due.insert(key),
            EventKind::Overdue => dedup.overdue.insert(key),
        }
    }

    fn emit(&self, kind: EventKind, context: EventContext, due_at: DateTime<Utc>, task: &Task) {
        let event = TaskEvent {
            kind,
            task_id: task.id.clone(),
            due_at,
            context,
            task: task.clone(),
        };
        debug!(kind = %kind, task_id = %task.id, due_at = %due_at, "emitting event");
        self.events.emit(&event);
    }

    /// Trim the dedup sets and persist them when new keys were recorded.
    async fn finish_pass(&self, recorded: bool) {
        let snapshot = {
            let mut dedup = lock(&self.dedup);
            let dropped = dedup.due.trim() + dedup.overdue.trim();
            if dropped > 0 {
                debug!(dropped, "trimmed occurrence dedup sets");
            }
            if !recorded && dropped == 0 {
                return;
            }
            LedgerSnapshot {
                version: 1,
                due: dedup.due.keys().cloned().collect(),
                overdue: dedup.overdue.keys().cloned().collect(),
            }
        };
        if let Some(ledger) = &self.ledger
            && let Err(e) = ledger.save(&snapshot).await
        {
            warn!("cannot persist occurrence ledger: {e}");
        }
    }

    /// Move the persisted last-run timestamp forward to `mark`. Never moves
    /// it backwards.
    async fn advance_last_run(&self, mark: DateTime<Utc>) {
        let key = self.config.last_run_key.as_str();
        let known = *lock(&self.last_run_mark);
        let known = match known {
            Some(known) => Some(known),
            None => match self.timestamps.load(key).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!("cannot read last-run timestamp: {e}");
                    return;
                }
            },
        };
        if known.is_some_and(|known| known >= mark) {
            *lock(&self.last_run_mark) = known;
            return;
        }
        match self.timestamps.save(key, mark).await {
            Ok(()) => *lock(&self.last_run_mark) = Some(mark),
            Err(e) => warn!("cannot persist last-run timestamp: {e}"),
        }
    }
}

/// Time until the next multiple of `interval` since the epoch; a full
/// interval when `now` sits exactly on a boundary.
pub(crate) fn delay_until_next_boundary(now: DateTime<Utc>, interval: Duration) -> Duration {
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1);
    let elapsed = now.timestamp_millis().rem_euclid(interval_ms);
    Duration::from_millis(u64::try_from(interval_ms - elapsed).unwrap_or(0))
}
