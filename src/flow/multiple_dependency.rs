//! Fan-in: one depender gated on a group of dependees.

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

/// Sugar over `Composed(depender, Grouped(dependees))` that exposes the
/// dependees themselves as children instead of the internal grouping.
pub struct MultipleDependencyExecutableFlow {
    inner: ComposedExecutableFlow,
    grouping: Arc<ExecutableFlow>,
}

impl MultipleDependencyExecutableFlow {
    pub fn new(
        id: impl Into<String>,
        depender: Arc<ExecutableFlow>,
        dependees: Vec<Arc<ExecutableFlow>>,
    ) -> Self {
        let id = id.into();
        let grouping = Arc::new(ExecutableFlow::Grouped(GroupedExecutableFlow::new(
            id.clone(),
            dependees,
        )));
        let inner = ComposedExecutableFlow::new(id, depender, Arc::clone(&grouping));
        Self { inner, grouping }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
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
        self.grouping.reset();
        for child in self.grouping.children() {
            child.reset();
        }
        ret
    }

    pub fn mark_completed(&self) -> bool {
        self.inner.mark_completed()
    }

    pub fn children(&self) -> Vec<Arc<ExecutableFlow>> {
        self.grouping.children()
    }

    pub(crate) fn depender(&self) -> &Arc<ExecutableFlow> {
        self.inner.depender()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testkit::{leaf, pool, wait, watch, TestFactory};
    use crate::jobs::job::JobFactory;

    fn fan_in(
        depender: &str,
        dependees: &[&str],
        factory: &Arc<TestFactory>,
    ) -> MultipleDependencyExecutableFlow {
        let dyn_factory: Arc<dyn JobFactory> = Arc::clone(factory) as _;
        let pool = pool();
        MultipleDependencyExecutableFlow::new(
            "1",
            leaf(depender, &dyn_factory, &pool),
            dependees.iter().map(|n| leaf(n, &dyn_factory, &pool)).collect(),
        )
    }

    #[test]
    fn test_depender_waits_for_every_dependee() {
        let factory = Arc::new(TestFactory::new());
        let flow = fan_in("sink", &["a", "b", "c"], &factory);

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        let log = factory.run_log();
        assert_eq!(log.last().map(String::as_str), Some("sink"));
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_dependee_failure_keeps_depender_unrun() {
        let factory = Arc::new(TestFactory::new().failing("b"));
        let flow = fan_in("sink", &["a", "b"], &factory);

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Failed);
        assert!(!factory.run_log().contains(&"sink".to_string()));
    }

    #[test]
    fn test_children_are_the_dependees() {
        let factory = Arc::new(TestFactory::new());
        let flow = fan_in("sink", &["b", "a"], &factory);
        let children = flow.children();
        let names: Vec<&str> = children.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_reset_covers_dependees() {
        let factory = Arc::new(TestFactory::new());
        let flow = fan_in("sink", &["a"], &factory);
        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        assert!(flow.reset());
        assert_eq!(flow.status(), Status::Ready);
        assert!(flow.children().iter().all(|c| c.status() == Status::Ready));
    }
}
