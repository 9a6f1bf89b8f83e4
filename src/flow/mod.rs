//! Flow templates, executable flow graphs, and their managers.

pub mod builder;
pub mod caching_manager;
pub mod callback;
pub mod composed;
pub mod error;
pub mod executable;
pub mod grouped;
pub mod individual;
pub mod manager;
pub mod multiple_dependency;
pub mod property_pusher;
pub mod refreshable_manager;
pub mod serialization;
pub mod status;
pub mod template;

#[cfg(test)]
pub(crate) mod testkit;

pub use caching_manager::CachingFlowManager;
pub use callback::{FlowCallback, SharedCallback};
pub use error::{BuildError, FlowError, PersistenceError};
pub use executable::ExecutableFlow;
pub use manager::{FlowManager, ImmutableFlowManager};
pub use refreshable_manager::RefreshableFlowManager;
pub use serialization::FlowExecutionHolder;
pub use status::Status;
pub use template::Flow;

use std::sync::Arc;

/// Recursively reset FAILED nodes so a partially failed execution can be
/// restarted. Children are reset before their parents; nodes in other
/// states are left alone.
pub fn reset_failed_flows(flow: &Arc<ExecutableFlow>) {
    if flow.status() != Status::Failed {
        return;
    }
    for child in flow.children() {
        reset_failed_flows(&child);
    }
    if !flow.reset() {
        log::warn!(
            "failed flow [{}] refused reset; was it restarted concurrently?",
            flow.name()
        );
    }
}
