//! Lifecycle states shared by flows and jobs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The lifecycle state of a flow node or job execution.
///
/// `Completed` is a terminal "skipped but counted as done" state, distinct
/// from `Succeeded`; it is reached only through `mark_completed()` and is
/// reported to late callers as a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ready,
    Running,
    Succeeded,
    Failed,
    Completed,
}

impl Status {
    /// True for states from which the node will not run again without a
    /// `reset()`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed | Status::Completed)
    }

    /// The status a late `execute()` caller is notified with.
    pub fn terminal_equivalent(self) -> Status {
        match self {
            Status::Completed => Status::Succeeded,
            other => other,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ready => "READY",
            Status::Running => "RUNNING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}
