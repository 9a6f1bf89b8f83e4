//! Property injection flows: push generated or static props down to a
//! group of children.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::common::props::Props;
use crate::flow::callback::SharedCallback;
use crate::flow::composed::ComposedExecutableFlow;
use crate::flow::error::FlowError;
use crate::flow::executable::ExecutableFlow;
use crate::flow::grouped::GroupedExecutableFlow;
use crate::flow::status::Status;

/// Keys that configure flow wiring and must never leak into children
/// through pushed properties.
pub const RESERVED_PROP_KEYS: [&str; 3] = ["type", "dependencies", "prop-dependency"];

/// Runs a property-producing flow first, then fans its return props out to
/// a group of children. Structurally `Composed(Grouped(children), property)`
/// with reserved keys stripped from the pushed props.
pub struct PropertyPusherExecutableFlow {
    name: String,
    inner: ComposedExecutableFlow,
    property_flow: Arc<ExecutableFlow>,
    grouping: Arc<ExecutableFlow>,
}

impl PropertyPusherExecutableFlow {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        property_flow: Arc<ExecutableFlow>,
        children: Vec<Arc<ExecutableFlow>>,
    ) -> Self {
        let id = id.into();
        let grouping = Arc::new(ExecutableFlow::Grouped(GroupedExecutableFlow::new(
            id.clone(),
            children,
        )));
        let inner = ComposedExecutableFlow::with_filtered_keys(
            id,
            Arc::clone(&grouping),
            Arc::clone(&property_flow),
            RESERVED_PROP_KEYS.iter().map(|k| k.to_string()).collect(),
        );
        Self {
            name: name.into(),
            inner,
            property_flow,
            grouping,
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execute(&self, parent_props: Props, callback: SharedCallback) -> Result<(), FlowError> {
        self.inner.execute(parent_props, callback)
    }

    pub fn cancel(&self) -> Result<bool, FlowError> {
        self.inner.cancel()
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    pub fn reset(&self) -> bool {
        let ret = self.inner.reset();
        self.property_flow.reset();
        ret
    }

    pub fn mark_completed(&self) -> bool {
        self.inner.mark_completed()
    }

    /// The property flow followed by the grouped children.
    pub fn children(&self) -> Vec<Arc<ExecutableFlow>> {
        let mut children = vec![Arc::clone(&self.property_flow)];
        children.extend(self.grouping.children());
        children
    }

    pub(crate) fn property_flow(&self) -> &Arc<ExecutableFlow> {
        &self.property_flow
    }

    pub(crate) fn grouped_children(&self) -> Vec<Arc<ExecutableFlow>> {
        self.grouping.children()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.start_time()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.inner.end_time()
    }

    pub fn parent_props(&self) -> Option<Props> {
        self.inner.parent_props()
    }

    pub fn return_props(&self) -> Option<Props> {
        self.inner.return_props()
    }

    pub fn exceptions(&self) -> HashMap<String, Arc<anyhow::Error>> {
        self.inner.exceptions()
    }
}


/// Layers a static set of props over the parent props handed to a group of
/// children. Reserved keys are stripped at construction.
pub struct PropertyPushingExecutableFlow {
    name: String,
    props: Props,
    inner: GroupedExecutableFlow,
}

impl PropertyPushingExecutableFlow {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        props: Props,
        children: Vec<Arc<ExecutableFlow>>,
    ) -> Self {
        Self {
            name: name.into(),
            props: props.without_keys(&RESERVED_PROP_KEYS),
            inner: GroupedExecutableFlow::new(id, children),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pushed_props(&self) -> &Props {
        &self.props
    }

    pub fn execute(&self, parent_props: Props, callback: SharedCallback) -> Result<(), FlowError> {
        let layered = Props::layered(&parent_props, &self.props);
        self.inner.execute(layered, callback)
    }

    pub fn cancel(&self) -> Result<bool, FlowError> {
        self.inner.cancel()
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    pub fn reset(&self) -> bool {
        self.inner.reset()
    }

    pub fn mark_completed(&self) -> bool {
        self.inner.mark_completed()
    }

    pub fn children(&self) -> Vec<Arc<ExecutableFlow>> {
        self.inner.children()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.inner.start_time()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.inner.end_time()
    }

    pub fn parent_props(&self) -> Option<Props> {
        self.inner.parent_props()
    }

    pub fn return_props(&self) -> Option<Props> {
        self.inner.return_props()
    }

    pub fn exceptions(&self) -> HashMap<String, Arc<anyhow::Error>> {
        self.inner.exceptions()
    }
}
