//! Descriptor registry and the job factory built on top of it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::common::props::Props;
use crate::jobs::descriptor::JobDescriptor;
use crate::jobs::job::{Job, JobFactory};
use crate::jobs::logging_job;
use crate::jobs::wrapping::JobWrappingFactory;

/// Where job descriptors come from. Loading returns the full current set;
/// callers re-load rather than mutate.
pub trait JobDescriptorSource: Send + Sync {
    fn load_descriptors(&self) -> Result<HashMap<String, JobDescriptor>, anyhow::Error>;
}

/// A descriptor source over a fixed in-memory set. Used by the runner
/// (descriptors parsed from the config file) and by tests.
#[derive(Default)]
pub struct InMemoryDescriptorSource {
    descriptors: Mutex<HashMap<String, JobDescriptor>>,
}

impl InMemoryDescriptorSource {
    pub fn new(descriptors: Vec<JobDescriptor>) -> Self {
        let map = descriptors
            .into_iter()
            .map(|d| (d.name().to_string(), d))
            .collect();
        Self {
            descriptors: Mutex::new(map),
        }
    }

    /// Replace or add a descriptor; the next load sees the change.
    pub fn upsert(&self, descriptor: JobDescriptor) {
        self.descriptors
            .lock()
            .unwrap()
            .insert(descriptor.name().to_string(), descriptor);
    }

    pub fn remove(&self, name: &str) {
        self.descriptors.lock().unwrap().remove(name);
    }
}

impl JobDescriptorSource for InMemoryDescriptorSource {
    fn load_descriptors(&self) -> Result<HashMap<String, JobDescriptor>, anyhow::Error> {
        Ok(self.descriptors.lock().unwrap().clone())
    }
}

/// Resolves names to descriptors and builds runnable jobs from them.
///
/// Descriptors are re-read from the source on every resolution, so a run
/// triggered after the source changed picks up the new definition.
pub struct JobManager {
    source: Arc<dyn JobDescriptorSource>,
    wrapping: Arc<JobWrappingFactory>,
    log_dir: PathBuf,
}

impl JobManager {
    pub fn new(
        source: Arc<dyn JobDescriptorSource>,
        wrapping: Arc<JobWrappingFactory>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            wrapping,
            log_dir: log_dir.into(),
        }
    }

    pub fn descriptors(&self) -> Result<HashMap<String, JobDescriptor>, anyhow::Error> {
        self.source.load_descriptors()
    }

    pub fn descriptor(&self, name: &str) -> Result<Option<JobDescriptor>, anyhow::Error> {
        Ok(self.source.load_descriptors()?.remove(name))
    }

    /// Fail-fast check used before committing to a schedule: the job and
    /// every transitive dependency must resolve.
    pub fn validate_job(&self, name: &str) -> Result<(), anyhow::Error> {
        let descriptors = self.source.load_descriptors()?;
        let mut pending = vec![name.to_string()];
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let descriptor = descriptors
                .get(&current)
                .ok_or_else(|| anyhow::anyhow!("job [{current}] does not exist"))?;
            pending.extend(descriptor.dependencies().iter().cloned());
        }
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Path to the newest log file written for `name`, if it has run.
    pub fn most_recent_log(&self, name: &str) -> Option<PathBuf> {
        logging_job::most_recent_log(&self.log_dir, name)
    }
}

impl JobFactory for JobManager {
    fn load_job(&self, name: &str, parent_props: &Props) -> Result<Arc<dyn Job>, anyhow::Error> {
        let descriptor = self
            .descriptor(name)?
            .ok_or_else(|| anyhow::anyhow!("no job descriptor named [{name}]"))?;
        let props = Props::layered(parent_props, &descriptor.props());
        Ok(self.wrapping.build_job(&descriptor, &props))
    }
}
