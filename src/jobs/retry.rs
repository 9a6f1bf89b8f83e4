//! Retry decorator for jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::props::Props;
use crate::jobs::job::Job;

/// Re-runs a failing job up to `retries` extra times, sleeping the backoff
/// between attempts. Cancellation stops the retry loop at the next attempt
/// boundary.
pub struct RetryingJob {
    inner: Arc<dyn Job>,
    retries: u32,
    backoff: Duration,
    cancelled: AtomicBool,
}

impl RetryingJob {
    pub fn new(inner: Arc<dyn Job>, retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            retries,
            backoff,
            cancelled: AtomicBool::new(false),
        }
    }
}

impl Job for RetryingJob {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn run(&self) -> Result<(), anyhow::Error> {
        let attempts = self.retries + 1;
        let mut last_err = None;
        for attempt in 1..=attempts {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(anyhow::anyhow!(
                    "job [{}] cancelled after {} attempt(s)",
                    self.id(),
                    attempt - 1
                ));
            }
            match self.inner.run() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "Job [{}] failed on attempt {attempt}/{attempts}: {e:#}",
                        self.id()
                    );
                    last_err = Some(e);
                    if attempt < attempts && !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("job [{}] failed", self.id())))
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FlakyJob {
        fail_times: u32,
        calls: AtomicU32,
    }

    impl Job for FlakyJob {
        fn id(&self) -> &str {
            "flaky"
        }

        fn run(&self) -> Result<(), anyhow::Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(anyhow::anyhow!("boom {call}"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_retries_until_success() {
        let inner = Arc::new(FlakyJob {
            fail_times: 2,
            calls: AtomicU32::new(0),
        });
        let job = RetryingJob::new(Arc::clone(&inner) as Arc<dyn Job>, 3, Duration::ZERO);
        assert!(job.run().is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_gives_up_after_budget() {
        let inner = Arc::new(FlakyJob {
            fail_times: 10,
            calls: AtomicU32::new(0),
        });
        let job = RetryingJob::new(Arc::clone(&inner) as Arc<dyn Job>, 2, Duration::ZERO);
        assert!(job.run().is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
