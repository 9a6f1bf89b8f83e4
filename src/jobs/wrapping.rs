//! Assembles the decorator stack around a base job.
//!
//! Wrap order is fixed: logging outermost, then resource throttling, then
//! retry, then the base job from the per-type factory. Retries therefore
//! happen while the resource locks are held, and the log file covers the
//! whole throttled run.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::props::Props;
use crate::jobs::descriptor::JobDescriptor;
use crate::jobs::job::Job;
use crate::jobs::locks::{GroupLock, JobLock, NamedPermitManager, ReadWriteLockManager};
use crate::jobs::logging_job::LoggingJob;
use crate::jobs::retry::RetryingJob;

/// The permit pool throttled jobs draw from.
pub const DEFAULT_PERMIT_POOL: &str = "default";

/// Creates the base runnable for one job type.
pub trait JobTypeFactory: Send + Sync {
    fn create(
        &self,
        descriptor: &JobDescriptor,
        props: &Props,
    ) -> Result<Arc<dyn Job>, anyhow::Error>;
}

/// Builds fully decorated jobs from descriptors.
pub struct JobWrappingFactory {
    type_factories: HashMap<String, Arc<dyn JobTypeFactory>>,
    permit_manager: Arc<NamedPermitManager>,
    lock_manager: Arc<ReadWriteLockManager>,
    log_dir: PathBuf,
}

impl JobWrappingFactory {
    pub fn new(
        type_factories: HashMap<String, Arc<dyn JobTypeFactory>>,
        permit_manager: Arc<NamedPermitManager>,
        lock_manager: Arc<ReadWriteLockManager>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            type_factories,
            permit_manager,
            lock_manager,
            log_dir: log_dir.into(),
        }
    }

    /// Build the decorated job for `descriptor`. A construction failure
    /// (unknown type, unsatisfiable permit demand, factory error) comes
    /// back as a job whose `run()` fails immediately with that error, so
    /// the failure flows through the normal FAILED path.
    pub fn build_job(&self, descriptor: &JobDescriptor, props: &Props) -> Arc<dyn Job> {
        match self.try_build(descriptor, props) {
            Ok(job) => job,
            Err(e) => {
                log::error!(
                    "Job [{}] could not be constructed: {e:#}",
                    descriptor.name()
                );
                Arc::new(InitErrorJob {
                    name: descriptor.name().to_string(),
                    error: Arc::new(e),
                })
            }
        }
    }

    fn try_build(
        &self,
        descriptor: &JobDescriptor,
        props: &Props,
    ) -> Result<Arc<dyn Job>, anyhow::Error> {
        let factory = self
            .type_factories
            .get(descriptor.job_type())
            .ok_or_else(|| {
                anyhow::anyhow!("no factory registered for job type [{}]", descriptor.job_type())
            })?;

        let mut job: Arc<dyn Job> = factory.create(descriptor, props)?;

        if descriptor.retries() > 0 {
            job = Arc::new(RetryingJob::new(
                job,
                descriptor.retries(),
                Duration::from_millis(descriptor.retry_backoff_ms()),
            ));
        }

        // Name-sorted assembly gives every job the same lock-acquisition
        // order, which rules out two-lock deadlocks between jobs.
        let mut locks: BTreeMap<String, Box<dyn JobLock>> = BTreeMap::new();
        if descriptor.num_permits() > 0 {
            let permit = self
                .permit_manager
                .get_named_permit(DEFAULT_PERMIT_POOL, descriptor.num_permits())?;
            locks.insert(format!("permit:{DEFAULT_PERMIT_POOL}"), Box::new(permit));
        }
        for name in descriptor.read_locks() {
            locks.insert(
                format!("read:{name}"),
                Box::new(self.lock_manager.read_lock(name)),
            );
        }
        for name in descriptor.write_locks() {
            locks.insert(
                format!("write:{name}"),
                Box::new(self.lock_manager.write_lock(name)),
            );
        }
        if !locks.is_empty() {
            let group = GroupLock::new(locks.into_values().collect());
            job = Arc::new(ResourceThrottledJob::new(job, group));
        }

        Ok(Arc::new(LoggingJob::new(job, self.log_dir.clone())))
    }
}

/// Holds the job's resource locks for the duration of its run. A cancel
/// that lands between lock acquisition and launch skips the run entirely.
pub struct ResourceThrottledJob {
    inner: Arc<dyn Job>,
    lock: GroupLock,
    cancelled: AtomicBool,
}

impl ResourceThrottledJob {
    pub fn new(inner: Arc<dyn Job>, lock: GroupLock) -> Self {
        Self {
            inner,
            lock,
            cancelled: AtomicBool::new(false),
        }
    }
}

struct LockGuard<'a> {
    lock: &'a GroupLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_lock();
    }
}

impl Job for ResourceThrottledJob {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn run(&self) -> Result<(), anyhow::Error> {
        self.lock.acquire_lock();
        let _guard = LockGuard { lock: &self.lock };

        if self.cancelled.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!(
                "job [{}] was cancelled while waiting for resource locks",
                self.id()
            ));
        }
        self.inner.run()
    }

    fn cancel(&self) -> Result<(), anyhow::Error> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.inner.cancel()
    }

    fn progress(&self) -> Result<f64, anyhow::Error> {
        self.inner.progress()
    }

    fn generated_properties(&self) -> Props {
        self.inner.generated_properties()
    }
}

/// Stand-in for a job that could not be constructed; running it reports
/// the construction error.
struct InitErrorJob {
    name: String,
    error: Arc<anyhow::Error>,
}

impl Job for InitErrorJob {
    fn id(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), anyhow::Error> {
        Err(anyhow::anyhow!(
            "job [{}] failed to initialize: {:#}",
            self.name,
            self.error
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingFactory {
        calls: Arc<AtomicU32>,
    }

    struct CountingJob {
        name: String,
        calls: Arc<AtomicU32>,
    }

    impl Job for CountingJob {
        fn id(&self) -> &str {
            &self.name
        }

        fn run(&self) -> Result<(), anyhow::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl JobTypeFactory for CountingFactory {
        fn create(
            &self,
            descriptor: &JobDescriptor,
            _props: &Props,
        ) -> Result<Arc<dyn Job>, anyhow::Error> {
            Ok(Arc::new(CountingJob {
                name: descriptor.name().to_string(),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    fn factory_with(calls: &Arc<AtomicU32>, log_dir: &std::path::Path) -> JobWrappingFactory {
        let mut types: HashMap<String, Arc<dyn JobTypeFactory>> = HashMap::new();
        types.insert(
            "counting".to_string(),
            Arc::new(CountingFactory {
                calls: Arc::clone(calls),
            }),
        );
        let permits = Arc::new(NamedPermitManager::new());
        permits.add_permits(DEFAULT_PERMIT_POOL, 2);
        JobWrappingFactory::new(
            types,
            permits,
            Arc::new(ReadWriteLockManager::new()),
            log_dir,
        )
    }

    #[test]
    fn test_builds_and_runs_decorated_job() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let factory = factory_with(&calls, dir.path());

        let descriptor = JobDescriptor::new("a", "counting")
            .with_retries(1, 0)
            .with_permits(1)
            .with_read_locks(vec!["table".to_string()]);
        let job = factory.build_job(&descriptor, &Props::new());
        assert!(job.run().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_type_becomes_init_error_job() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let factory = factory_with(&calls, dir.path());

        let descriptor = JobDescriptor::new("a", "unregistered");
        let job = factory.build_job(&descriptor, &Props::new());
        let err = job.run().unwrap_err();
        assert!(err.to_string().contains("failed to initialize"));
    }

    #[test]
    fn test_excessive_permit_demand_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let factory = factory_with(&calls, dir.path());

        let descriptor = JobDescriptor::new("a", "counting").with_permits(99);
        let job = factory.build_job(&descriptor, &Props::new());
        assert!(job.run().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
