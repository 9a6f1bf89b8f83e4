//! The executable flow sum type.
//!
//! Every node in a runnable flow graph is one of these variants. Nodes are
//! shared through `Arc` so that diamond dependencies execute once and
//! report once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::common::props::Props;
use crate::flow::callback::SharedCallback;
use crate::flow::composed::ComposedExecutableFlow;
use crate::flow::error::FlowError;
use crate::flow::grouped::GroupedExecutableFlow;
use crate::flow::individual::IndividualJobExecutableFlow;
use crate::flow::multiple_dependency::MultipleDependencyExecutableFlow;
use crate::flow::property_pusher::{PropertyPusherExecutableFlow, PropertyPushingExecutableFlow};
use crate::flow::status::Status;

pub enum ExecutableFlow {
    Individual(IndividualJobExecutableFlow),
    Composed(ComposedExecutableFlow),
    Grouped(GroupedExecutableFlow),
    MultipleDependency(MultipleDependencyExecutableFlow),
    PropertyPusher(PropertyPusherExecutableFlow),
    PropertyPushing(PropertyPushingExecutableFlow),
}

macro_rules! dispatch {
    ($self:expr, $flow:ident => $body:expr) => {
        match $self {
            ExecutableFlow::Individual($flow) => $body,
            ExecutableFlow::Composed($flow) => $body,
            ExecutableFlow::Grouped($flow) => $body,
            ExecutableFlow::MultipleDependency($flow) => $body,
            ExecutableFlow::PropertyPusher($flow) => $body,
            ExecutableFlow::PropertyPushing($flow) => $body,
        }
    };
}

impl ExecutableFlow {
    /// The execution this node belongs to.
    pub fn id(&self) -> &str {
        dispatch!(self, flow => flow.id())
    }

    pub fn name(&self) -> &str {
        dispatch!(self, flow => flow.name())
    }

    /// Start, or attach to, a run of this node. Non-blocking; completion is
    /// reported through `callback`. The first executing caller pins
    /// `parent_props` for the run; later callers must match them.
    pub fn execute(&self, parent_props: Props, callback: SharedCallback) -> Result<(), FlowError> {
        dispatch!(self, flow => flow.execute(parent_props, callback))
    }

    /// Best-effort cancellation. Returns whether this node and everything
    /// under it ended up cancelled.
    pub fn cancel(&self) -> Result<bool, FlowError> {
        dispatch!(self, flow => flow.cancel())
    }

    pub fn status(&self) -> Status {
        dispatch!(self, flow => flow.status())
    }

    /// Return the node to READY for another run. Refused while RUNNING.
    pub fn reset(&self) -> bool {
        dispatch!(self, flow => flow.reset())
    }

    /// Short-circuit the node to COMPLETED so dependers treat it as done.
    /// Refused while RUNNING.
    pub fn mark_completed(&self) -> bool {
        dispatch!(self, flow => flow.mark_completed())
    }

    pub fn has_children(&self) -> bool {
        !matches!(self, ExecutableFlow::Individual(_))
    }

    pub fn children(&self) -> Vec<Arc<ExecutableFlow>> {
        match self {
            ExecutableFlow::Individual(_) => Vec::new(),
            ExecutableFlow::Composed(flow) => flow.children(),
            ExecutableFlow::Grouped(flow) => flow.children(),
            ExecutableFlow::MultipleDependency(flow) => flow.children(),
            ExecutableFlow::PropertyPusher(flow) => flow.children(),
            ExecutableFlow::PropertyPushing(flow) => flow.children(),
        }
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        dispatch!(self, flow => flow.start_time())
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        dispatch!(self, flow => flow.end_time())
    }

    pub fn parent_props(&self) -> Option<Props> {
        dispatch!(self, flow => flow.parent_props())
    }

    pub fn return_props(&self) -> Option<Props> {
        dispatch!(self, flow => flow.return_props())
    }

    /// Failures recorded under this node, keyed by flow name.
    pub fn exceptions(&self) -> HashMap<String, Arc<anyhow::Error>> {
        dispatch!(self, flow => flow.exceptions())
    }
}

impl std::fmt::Debug for ExecutableFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableFlow")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}
