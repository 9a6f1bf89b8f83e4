//! Time-based scheduling of flows.
//!
//! The scheduler owns the `scheduled` table (persisted to disk with a
//! backup rotation), arms one timer per entry on the worker pool, and
//! hands actual execution to the `JobExecutorManager`. Recurring entries
//! re-register themselves when their run completes.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crate::common::worker_pool::WorkerPool;
use crate::jobs::executor::{ExecutionError, ExecutionRecord, JobExecutorManager};
use crate::jobs::manager::JobManager;
use crate::flow::status::Status;

const SCHEDULE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d.%H.%M.%S.%3f";

/// Hard cap on period additions when advancing a stale fire time.
const MAX_PERIOD_INCREMENTS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job [{0}] is already scheduled; unschedule it first")]
    AlreadyScheduled(String),

    #[error("job [{name}] cannot be scheduled: {source}")]
    InvalidJob {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("advancing the fire time of [{0}] took more than {MAX_PERIOD_INCREMENTS} periods")]
    AdvanceOverflow(String),

    #[error("malformed schedule line [{0}]")]
    MalformedSchedule(String),

    #[error("failed to persist the schedule table")]
    Persist(#[source] std::io::Error),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Recurrence period of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePeriod {
    Days(u32),
    Hours(u32),
    Minutes(u32),
    Seconds(u32),
}

impl SchedulePeriod {
    pub fn to_duration(self) -> Duration {
        match self {
            SchedulePeriod::Days(n) => Duration::days(n as i64),
            SchedulePeriod::Hours(n) => Duration::hours(n as i64),
            SchedulePeriod::Minutes(n) => Duration::minutes(n as i64),
            SchedulePeriod::Seconds(n) => Duration::seconds(n as i64),
        }
    }

    /// Parse a period code: `n` means non-recurring (`None`), otherwise
    /// `{N}{d|h|m|s}`.
    pub fn parse(code: &str) -> Result<Option<Self>, SchedulerError> {
        if code == "n" {
            return Ok(None);
        }
        let (digits, unit) = code.split_at(code.len().saturating_sub(1));
        let n: u32 = digits
            .parse()
            .map_err(|_| SchedulerError::MalformedSchedule(code.to_string()))?;
        match unit {
            "d" => Ok(Some(SchedulePeriod::Days(n))),
            "h" => Ok(Some(SchedulePeriod::Hours(n))),
            "m" => Ok(Some(SchedulePeriod::Minutes(n))),
            "s" => Ok(Some(SchedulePeriod::Seconds(n))),
            _ => Err(SchedulerError::MalformedSchedule(code.to_string())),
        }
    }

    pub fn format_code(period: Option<SchedulePeriod>) -> String {
        match period {
            None => "n".to_string(),
            Some(SchedulePeriod::Days(n)) => format!("{n}d"),
            Some(SchedulePeriod::Hours(n)) => format!("{n}h"),
            Some(SchedulePeriod::Minutes(n)) => format!("{n}m"),
            Some(SchedulePeriod::Seconds(n)) => format!("{n}s"),
        }
    }
}

impl fmt::Display for SchedulePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&SchedulePeriod::format_code(Some(*self)))
    }
}

/// One entry in the schedule table.
#[derive(Clone)]
pub struct ScheduledJob {
    name: String,
    fire_time: DateTime<Utc>,
    period: Option<SchedulePeriod>,
    ignore_deps: bool,
    /// Set by `unschedule`; an in-flight timer firing for an invalidated
    /// entry becomes a no-op.
    invalid: Arc<AtomicBool>,
}

impl ScheduledJob {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fire_time(&self) -> DateTime<Utc> {
        self.fire_time
    }

    pub fn period(&self) -> Option<SchedulePeriod> {
        self.period
    }

    pub fn ignore_deps(&self) -> bool {
        self.ignore_deps
    }

    pub fn is_recurring(&self) -> bool {
        self.period.is_some()
    }

    fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }

    fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    fn to_line(&self) -> String {
        format!(
            "{} = {} {} {}",
            self.name,
            self.fire_time.format(SCHEDULE_TIMESTAMP_FORMAT),
            SchedulePeriod::format_code(self.period),
            self.ignore_deps
        )
    }

    fn from_line(line: &str) -> Result<Self, SchedulerError> {
        let malformed = || SchedulerError::MalformedSchedule(line.to_string());
        let (name, rest) = line.split_once('=').ok_or_else(malformed)?;
        let mut parts = rest.split_whitespace();
        let ts = parts.next().ok_or_else(malformed)?;
        let period = parts.next().ok_or_else(malformed)?;
        let flag = parts.next().ok_or_else(malformed)?;
        if parts.next().is_some() {
            return Err(malformed());
        }

        let naive = NaiveDateTime::parse_from_str(ts, SCHEDULE_TIMESTAMP_FORMAT)
            .map_err(|_| malformed())?;
        let fire_time = Utc.from_utc_datetime(&naive);
        let period = SchedulePeriod::parse(period)?;
        let ignore_deps = match flag {
            "true" => true,
            "false" => false,
            _ => return Err(malformed()),
        };

        Ok(Self {
            name: name.trim().to_string(),
            fire_time,
            period,
            ignore_deps,
            invalid: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Add `period` to `fire_time` until the result is after `now`.
fn advance_past(
    name: &str,
    fire_time: DateTime<Utc>,
    period: SchedulePeriod,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    let step = period.to_duration();
    let mut next = fire_time;
    let mut increments = 0;
    while next <= now {
        next += step;
        increments += 1;
        if increments > MAX_PERIOD_INCREMENTS {
            return Err(SchedulerError::AdvanceOverflow(name.to_string()));
        }
    }
    Ok(next)
}

struct SchedulerInner {
    executor: JobExecutorManager,
    job_manager: Arc<JobManager>,
    pool: Arc<WorkerPool>,
    scheduled: DashMap<String, ScheduledJob>,
    schedule_file: PathBuf,
    backup_file: PathBuf,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        executor: JobExecutorManager,
        job_manager: Arc<JobManager>,
        pool: Arc<WorkerPool>,
        schedule_file: impl Into<PathBuf>,
    ) -> Self {
        let schedule_file = schedule_file.into();
        let backup_file = schedule_file.with_extension("backup");
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                job_manager,
                pool,
                scheduled: DashMap::new(),
                schedule_file,
                backup_file,
            }),
        }
    }

    /// Read the persisted schedule table and re-arm every entry. Prefers
    /// the primary file; falls back to promoting the backup after a crash
    /// mid-rewrite. Stale entries are advanced (recurring) or dropped
    /// (one-shot).
    pub fn load(&self) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        if !inner.schedule_file.exists() && inner.backup_file.exists() {
            log::warn!(
                "schedule file missing; recovering from backup {:?}",
                inner.backup_file
            );
            std::fs::rename(&inner.backup_file, &inner.schedule_file)
                .map_err(SchedulerError::Persist)?;
        }
        let contents = match std::fs::read_to_string(&inner.schedule_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SchedulerError::Persist(e)),
        };

        let now = Utc::now();
        let mut restored = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut job = ScheduledJob::from_line(line)?;
            if job.fire_time <= now {
                match job.period {
                    Some(period) => {
                        job.fire_time = advance_past(&job.name, job.fire_time, period, now)?;
                    }
                    None => {
                        log::warn!(
                            "dropping stale one-shot schedule for [{}] (was due {})",
                            job.name,
                            job.fire_time
                        );
                        continue;
                    }
                }
            }
            self.install(job.clone());
            restored.push(job);
        }
        // A single rewrite once the whole table is in: persisting per entry
        // would rotate the pre-load table into the backup and immediately
        // overwrite it, so a crash mid-load could lose unread entries.
        self.persist_schedule()?;
        for job in restored {
            self.arm_timer(job);
        }
        Ok(())
    }

    /// Schedule a one-shot run of `name` at `fire_time`.
    pub fn schedule_once(
        &self,
        name: &str,
        fire_time: DateTime<Utc>,
        ignore_deps: bool,
    ) -> Result<(), SchedulerError> {
        self.schedule(name, fire_time, None, ignore_deps)
    }

    /// Schedule `name` at `fire_time`, recurring every `period` if given.
    /// A name can hold at most one schedule; the job is validated before
    /// the schedule is committed.
    pub fn schedule(
        &self,
        name: &str,
        fire_time: DateTime<Utc>,
        period: Option<SchedulePeriod>,
        ignore_deps: bool,
    ) -> Result<(), SchedulerError> {
        if self.inner.scheduled.contains_key(name) {
            return Err(SchedulerError::AlreadyScheduled(name.to_string()));
        }
        self.inner
            .job_manager
            .validate_job(name)
            .map_err(|e| SchedulerError::InvalidJob {
                name: name.to_string(),
                source: e,
            })?;

        self.register(ScheduledJob {
            name: name.to_string(),
            fire_time,
            period,
            ignore_deps,
            invalid: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Schedule `name` at the next occurrence of the given wall-clock time
    /// of day (today if still ahead, otherwise tomorrow).
    pub fn schedule_at_time_of_day(
        &self,
        name: &str,
        time_of_day: NaiveTime,
        period: Option<SchedulePeriod>,
        ignore_deps: bool,
    ) -> Result<(), SchedulerError> {
        let fire_time = next_occurrence(time_of_day, Utc::now());
        self.schedule(name, fire_time, period, ignore_deps)
    }

    /// Insert, persist, and arm a timer. The duplicate check is done by
    /// `schedule`; re-registration of a recurring job comes through here
    /// directly.
    fn register(&self, job: ScheduledJob) -> Result<(), SchedulerError> {
        self.install(job.clone());
        self.persist_schedule()?;
        self.arm_timer(job);
        Ok(())
    }

    fn install(&self, job: ScheduledJob) {
        log::info!(
            "scheduling [{}] at {} (period {}, ignore_deps {})",
            job.name,
            job.fire_time,
            SchedulePeriod::format_code(job.period),
            job.ignore_deps
        );
        self.inner.scheduled.insert(job.name.clone(), job);
    }

    fn arm_timer(&self, job: ScheduledJob) {
        let scheduler = self.clone();
        let delay = (job.fire_time - Utc::now())
            .to_std()
            .unwrap_or(StdDuration::ZERO);
        self.inner.pool.spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.fire(job);
        });
    }

    /// A timer fired. Everything here is defensive: a bug escaping the
    /// trigger path must not leave the scheduled map holding a dead entry.
    fn fire(&self, job: ScheduledJob) {
        if job.is_invalid() {
            log::info!("timer for [{}] fired after unschedule; ignoring", job.name);
            return;
        }
        let result = catch_unwind(AssertUnwindSafe(|| self.trigger(&job)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("trigger of [{}] failed: {e}", job.name);
                self.forget(&job.name);
            }
            Err(_) => {
                log::error!("trigger of [{}] panicked; cleaning up its entries", job.name);
                self.forget(&job.name);
            }
        }
    }

    fn trigger(&self, job: &ScheduledJob) -> Result<(), SchedulerError> {
        // The entry leaves `scheduled` once it is being turned into an
        // execution; recurring jobs come back via the completion hook.
        self.inner.scheduled.remove(&job.name);

        let hook: Option<Box<dyn Fn(Status) + Send + Sync>> = if job.is_recurring() {
            let scheduler = self.clone();
            let job = job.clone();
            Some(Box::new(move |_status: Status| {
                scheduler.reschedule_recurring(&job);
            }))
        } else {
            Some(Box::new({
                let scheduler = self.clone();
                move |_status: Status| {
                    if let Err(e) = scheduler.persist_schedule() {
                        log::error!("failed persisting schedule table: {e}");
                    }
                }
            }))
        };

        self.inner
            .executor
            .execute_with_hook(&job.name, job.ignore_deps, hook)?;
        Ok(())
    }

    fn reschedule_recurring(&self, job: &ScheduledJob) {
        if job.is_invalid() {
            log::info!(
                "[{}] was unscheduled while running; not re-registering",
                job.name
            );
            return;
        }
        let period = match job.period {
            Some(period) => period,
            None => return,
        };
        match advance_past(&job.name, job.fire_time, period, Utc::now()) {
            Ok(next) => {
                let next_job = ScheduledJob {
                    name: job.name.clone(),
                    fire_time: next,
                    period: job.period,
                    ignore_deps: job.ignore_deps,
                    invalid: Arc::clone(&job.invalid),
                };
                if let Err(e) = self.register(next_job) {
                    log::error!("failed to re-register recurring job [{}]: {e}", job.name);
                }
            }
            Err(e) => log::error!("cannot compute next fire time for [{}]: {e}", job.name),
        }
    }

    /// Remove `name` from the schedule. Returns whether an entry existed.
    pub fn unschedule(&self, name: &str) -> Result<bool, SchedulerError> {
        let removed = self.inner.scheduled.remove(name);
        let existed = match removed {
            Some((_, job)) => {
                job.mark_invalid();
                true
            }
            None => false,
        };
        self.persist_schedule()?;
        Ok(existed)
    }

    fn forget(&self, name: &str) {
        self.inner.scheduled.remove(name);
        if let Err(e) = self.persist_schedule() {
            log::error!("failed persisting schedule table: {e}");
        }
    }

    /// Rewrite the schedule table, rotating the current primary to the
    /// backup file first so a crash mid-write loses nothing.
    fn persist_schedule(&self) -> Result<(), SchedulerError> {
        let inner = &self.inner;
        if inner.schedule_file.exists() {
            std::fs::rename(&inner.schedule_file, &inner.backup_file)
                .map_err(SchedulerError::Persist)?;
        }
        if let Some(parent) = inner.schedule_file.parent() {
            std::fs::create_dir_all(parent).map_err(SchedulerError::Persist)?;
        }
        let mut lines: Vec<String> = inner
            .scheduled
            .iter()
            .map(|e| e.value().to_line())
            .collect();
        lines.sort();
        let mut contents = lines.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        std::fs::write(&inner.schedule_file, contents).map_err(SchedulerError::Persist)
    }

    pub fn cancel(&self, name: &str) -> Result<(), ExecutionError> {
        self.inner.executor.cancel(name)
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.inner.scheduled.contains_key(name)
    }

    pub fn scheduled_jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> =
            self.inner.scheduled.iter().map(|e| e.value().clone()).collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn is_executing(&self, name: &str) -> bool {
        self.inner.executor.is_executing(name)
    }

    pub fn executing(&self) -> Vec<ExecutionRecord> {
        self.inner.executor.executing()
    }

    pub fn completed(&self) -> Vec<ExecutionRecord> {
        self.inner.executor.completed()
    }
}

/// Next occurrence of a wall-clock time of day relative to `now`.
fn next_occurrence(time_of_day: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive().and_time(time_of_day);
    let candidate = Utc.from_utc_datetime(&today);
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}
