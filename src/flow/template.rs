//! Flow templates.
//!
//! A `Flow` is the immutable, reusable description of a dependency graph.
//! Each call to `create_executable_flow` stamps out a fresh run-state graph
//! of `ExecutableFlow` nodes, deduplicating shared nodes through the
//! overrides map so a diamond dependency becomes a single shared node.

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::props::Props;
use crate::common::worker_pool::WorkerPool;
use crate::flow::executable::ExecutableFlow;
use crate::flow::grouped::GroupedExecutableFlow;
use crate::flow::individual::IndividualJobExecutableFlow;
use crate::flow::multiple_dependency::MultipleDependencyExecutableFlow;
use crate::flow::property_pusher::{PropertyPusherExecutableFlow, PropertyPushingExecutableFlow};
use crate::jobs::job::JobFactory;

pub enum Flow {
    Individual(IndividualJobFlow),
    Composed(ComposedFlow),
    Grouped(GroupedFlow),
    MultipleDependency(MultipleDependencyFlow),
    PropertyPusher(PropertyPusherFlow),
    PropertyPushing(PropertyPushingFlow),
}

impl Flow {
    pub fn name(&self) -> &str {
        match self {
            Flow::Individual(f) => &f.name,
            Flow::Composed(f) => f.depender.name(),
            Flow::Grouped(f) => &f.name,
            Flow::MultipleDependency(f) => f.depender.name(),
            Flow::PropertyPusher(f) => &f.name,
            Flow::PropertyPushing(f) => &f.name,
        }
    }

    pub fn has_children(&self) -> bool {
        !matches!(self, Flow::Individual(_))
    }

    pub fn children(&self) -> Vec<Arc<Flow>> {
        match self {
            Flow::Individual(_) => Vec::new(),
            Flow::Composed(f) => vec![Arc::clone(&f.dependee)],
            Flow::Grouped(f) => f.flows.clone(),
            Flow::MultipleDependency(f) => f.dependees.clone(),
            Flow::PropertyPusher(f) => {
                let mut children = vec![Arc::clone(&f.property_flow)];
                children.extend(f.children.iter().cloned());
                children
            }
            Flow::PropertyPushing(f) => f.children.clone(),
        }
    }

    /// Instantiate a run-state graph for execution `id`.
    ///
    /// `overrides` maps names already instantiated in this stamping pass to
    /// their shared nodes. Panics on a name collision with an entry this
    /// pass did not create, since that is a construction bug in the
    /// template graph.
    pub fn create_executable_flow(
        &self,
        id: &str,
        overrides: &mut HashMap<String, Arc<ExecutableFlow>>,
    ) -> Arc<ExecutableFlow> {
        match self {
            Flow::Individual(f) => {
                if let Some(existing) = overrides.get(&f.name) {
                    return Arc::clone(existing);
                }
                let node = Arc::new(ExecutableFlow::Individual(IndividualJobExecutableFlow::new(
                    id,
                    f.name.clone(),
                    Arc::clone(&f.factory),
                    Arc::clone(&f.pool),
                )));
                register(overrides, node)
            }
            Flow::Composed(f) => {
                let dependee = instantiate(&f.dependee, id, overrides);
                // The depender subtree is stamped in isolation so it cannot
                // alias nodes from the dependee side.
                let mut depender_overrides = HashMap::new();
                let depender = instantiate(&f.depender, id, &mut depender_overrides);
                let node = Arc::new(ExecutableFlow::Composed(
                    crate::flow::composed::ComposedExecutableFlow::new(id, depender, dependee),
                ));
                register(overrides, node)
            }
            Flow::Grouped(f) => {
                let children: Vec<Arc<ExecutableFlow>> = f
                    .flows
                    .iter()
                    .map(|child| instantiate(child, id, overrides))
                    .collect();
                // A grouping is an abstraction over its members, not a node
                // other flows may depend on by name.
                Arc::new(ExecutableFlow::Grouped(GroupedExecutableFlow::new(
                    id, children,
                )))
            }
            Flow::MultipleDependency(f) => {
                let dependees: Vec<Arc<ExecutableFlow>> = f
                    .dependees
                    .iter()
                    .map(|child| instantiate(child, id, overrides))
                    .collect();
                let mut depender_overrides = HashMap::new();
                let depender = instantiate(&f.depender, id, &mut depender_overrides);
                let node = Arc::new(ExecutableFlow::MultipleDependency(
                    MultipleDependencyExecutableFlow::new(id, depender, dependees),
                ));
                register(overrides, node)
            }
            Flow::PropertyPusher(f) => {
                let property_flow = instantiate(&f.property_flow, id, overrides);
                let mut child_overrides = HashMap::new();
                let children: Vec<Arc<ExecutableFlow>> = f
                    .children
                    .iter()
                    .map(|child| instantiate(child, id, &mut child_overrides))
                    .collect();
                let node = Arc::new(ExecutableFlow::PropertyPusher(
                    PropertyPusherExecutableFlow::new(id, f.name.clone(), property_flow, children),
                ));
                register(overrides, node)
            }
            Flow::PropertyPushing(f) => {
                let children: Vec<Arc<ExecutableFlow>> = f
                    .children
                    .iter()
                    .map(|child| instantiate(child, id, overrides))
                    .collect();
                let node = Arc::new(ExecutableFlow::PropertyPushing(
                    PropertyPushingExecutableFlow::new(id, f.name.clone(), f.props.clone(), children),
                ));
                register(overrides, node)
            }
        }
    }
}

fn instantiate(
    flow: &Arc<Flow>,
    id: &str,
    overrides: &mut HashMap<String, Arc<ExecutableFlow>>,
) -> Arc<ExecutableFlow> {
    if let Some(existing) = overrides.get(flow.name()) {
        return Arc::clone(existing);
    }
    flow.create_executable_flow(id, overrides)
}

fn register(
    overrides: &mut HashMap<String, Arc<ExecutableFlow>>,
    node: Arc<ExecutableFlow>,
) -> Arc<ExecutableFlow> {
    let name = node.name().to_string();
    if overrides.insert(name.clone(), Arc::clone(&node)).is_some() {
        panic!("encountered a duplicate flow node [{name}] while instantiating an executable flow");
    }
    node
}

/// Leaf template: one named job.
pub struct IndividualJobFlow {
    pub name: String,
    factory: Arc<dyn JobFactory>,
    pool: Arc<WorkerPool>,
}

impl IndividualJobFlow {
    pub fn new(
        name: impl Into<String>,
        factory: Arc<dyn JobFactory>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            name: name.into(),
            factory,
            pool,
        }
    }
}

pub struct ComposedFlow {
    pub depender: Arc<Flow>,
    pub dependee: Arc<Flow>,
}

pub struct GroupedFlow {
    name: String,
    pub flows: Vec<Arc<Flow>>,
}

impl GroupedFlow {
    pub fn new(flows: Vec<Arc<Flow>>) -> Self {
        let name = flows
            .iter()
            .map(|f| f.name().to_string())
            .collect::<Vec<_>>()
            .join(" + ");
        Self { name, flows }
    }
}

pub struct MultipleDependencyFlow {
    pub depender: Arc<Flow>,
    pub dependees: Vec<Arc<Flow>>,
}

pub struct PropertyPusherFlow {
    pub name: String,
    pub property_flow: Arc<Flow>,
    pub children: Vec<Arc<Flow>>,
}

pub struct PropertyPushingFlow {
    pub name: String,
    pub props: Props,
    pub children: Vec<Arc<Flow>>,
}
