//! Error types for flow construction and execution.

use thiserror::Error;

/// Errors raised by `ExecutableFlow` operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// `execute()` was called with override properties differing from the
    /// ones the current run was started with. Call `reset()` before
    /// executing again with different properties.
    #[error(
        "{flow}.execute() called with differing parent properties. \
         Call reset() before executing again with different properties. \
         pinned[{pinned}], given[{given}]"
    )]
    PropsMismatch {
        flow: String,
        pinned: String,
        given: String,
    },

    /// Cancelling the underlying job itself failed.
    #[error("cancel of job [{name}] failed")]
    CancelFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised while building a `Flow` tree from job descriptors.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A descriptor depends on a job id that does not exist.
    #[error("job [{depender}] depends on unknown job [{dependee}]")]
    UnknownJob { depender: String, dependee: String },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle detected: {path}")]
    DependencyCycle { path: String },
}

/// Errors raised by the flow-manager persistence layer.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to write execution snapshot [{id}]")]
    Write {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read execution snapshot [{id}]")]
    Read {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("execution snapshot [{id}] is not valid JSON")]
    Malformed {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("execution snapshot [{id}] references unknown job [{job}]")]
    UnknownJob { id: String, job: String },
}
