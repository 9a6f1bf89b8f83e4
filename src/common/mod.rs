//! Shared primitives: property layering, mail contract, worker pool, fs helpers.

pub mod files;
pub mod mailer;
pub mod props;
pub mod worker_pool;

pub use mailer::{LoggingMailman, Mailman, RecordingMailman};
pub use props::Props;
pub use worker_pool::WorkerPool;
