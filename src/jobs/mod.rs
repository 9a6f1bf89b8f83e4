//! Jobs: the unit of work, its descriptors, decorators, and the executor.

pub mod descriptor;
pub mod executor;
pub mod job;
pub mod locks;
pub mod logging_job;
pub mod manager;
pub mod process;
pub mod retry;
pub mod wrapping;

pub use descriptor::JobDescriptor;
pub use executor::{ExecutionError, ExecutionRecord, JobExecutorManager};
pub use job::{Job, JobFactory};
pub use locks::{GroupLock, JobLock, NamedPermitManager, ReadWriteLockManager};
pub use manager::{InMemoryDescriptorSource, JobDescriptorSource, JobManager};
pub use process::{ProcessJob, ProcessJobFactory};
pub use wrapping::{JobTypeFactory, JobWrappingFactory};
