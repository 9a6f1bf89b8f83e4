//! Asynchronous completion/progress notification contract.
//!
//! There is no guarantee about which thread invokes a callback. Callback
//! delivery always happens with node locks released; implementations are
//! free to call back into `execute()` on the notifying node.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::flow::status::Status;

/// A callback attached to a flow execution through `execute()`.
pub trait FlowCallback: Send + Sync {
    /// Some subset of the flow finished; the flow as a whole is still going.
    fn progress_made(&self);

    /// The entire flow reached a terminal state.
    fn completed(&self, status: Status);
}

/// Shared, clonable handle to a callback.
pub type SharedCallback = Arc<dyn FlowCallback>;

/// Invoke `completed` on every callback, isolating each invocation: a
/// panicking callback is logged and must not stop its siblings.
pub(crate) fn call_completed(callbacks: &[SharedCallback], status: Status) {
    for cb in callbacks {
        let result = catch_unwind(AssertUnwindSafe(|| cb.completed(status)));
        if result.is_err() {
            log::error!("A flow callback panicked during completed({status}) notification");
        }
    }
}

/// Invoke `progress_made` on every callback with the same isolation rules.
pub(crate) fn call_progress(callbacks: &[SharedCallback]) {
    for cb in callbacks {
        let result = catch_unwind(AssertUnwindSafe(|| cb.progress_made()));
        if result.is_err() {
            log::error!("A flow callback panicked during progress notification");
        }
    }
}
