//! Bounded background execution pool.
//!
//! All job bodies and timer firings run here, on a dedicated multi-thread
//! Tokio runtime owned by the pool; `execute()` on a flow node never blocks
//! the caller on downstream work. Job bodies are synchronous and go through
//! `spawn_blocking` so they cannot starve the timer threads.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

static POOL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fixed-size worker pool driving job execution and scheduling timers.
pub struct WorkerPool {
    runtime: Runtime,
}

impl WorkerPool {
    /// Create a pool with at most `max_threads` concurrent job bodies.
    pub fn new(max_threads: usize) -> Self {
        let n = POOL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(max_threads.max(1))
            .thread_name(format!("jobflow-worker-{n}"))
            .enable_all()
            .build()
            .expect("failed to create jobflow worker runtime");
        Self { runtime }
    }

    /// Run a synchronous job body on a dedicated blocking thread.
    pub fn run_job<F>(&self, f: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.runtime.spawn_blocking(f)
    }

    /// Spawn an async task (timers, trigger handling).
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(fut)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(num_default_threads())
    }
}

fn num_default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
