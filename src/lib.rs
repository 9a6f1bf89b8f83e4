//! # Jobflow
//!
//! A workflow engine for dependency-driven batch jobs. Job descriptors
//! declare named units of work and the jobs they depend on; the flow
//! layer turns those declarations into executable dependency graphs,
//! runs them on a worker pool, persists execution state as JSON
//! snapshots, and schedules recurring runs with e-mail notification on
//! completion.

pub mod common;
pub mod config;
pub mod flow;
pub mod jobs;
pub mod scheduler;

pub use common::props::Props;
pub use common::worker_pool::WorkerPool;
pub use config::AppConfig;
pub use flow::executable::ExecutableFlow;
pub use flow::status::Status;
pub use flow::template::Flow;
pub use jobs::{Job, JobDescriptor, JobExecutorManager, JobFactory, JobManager};
pub use scheduler::{SchedulePeriod, Scheduler};
