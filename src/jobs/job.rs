//! The unit-of-work contract consumed by leaf flows.

use std::sync::Arc;

use crate::common::props::Props;

/// A runnable unit of work.
///
/// `run()` executes synchronously on a worker thread; returning `Ok` signals
/// success, returning `Err` signals failure. `cancel()` is best-effort and
/// may be called from any thread while `run()` is in flight.
pub trait Job: Send + Sync {
    /// The job's identifier (the flow-node name it runs under).
    fn id(&self) -> &str;

    /// Execute the work to completion.
    fn run(&self) -> Result<(), anyhow::Error>;

    /// Best-effort cancellation of an in-flight run.
    fn cancel(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Completion fraction in `[0.0, 1.0]`, if the job can estimate it.
    fn progress(&self) -> Result<f64, anyhow::Error> {
        Ok(0.0)
    }

    /// Properties produced by a successful run, handed to downstream flows.
    fn generated_properties(&self) -> Props {
        Props::new()
    }
}

/// Produces a runnable [`Job`] for a named flow node at execution time.
///
/// The factory is consulted once per run, when the leaf node actually
/// launches, so descriptor changes on disk are picked up by the next run.
pub trait JobFactory: Send + Sync {
    fn load_job(&self, name: &str, parent_props: &Props) -> Result<Arc<dyn Job>, anyhow::Error>;
}
