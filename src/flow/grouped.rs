//! Parallel fan-out: all children run at once, success requires all of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::common::props::Props;
use crate::flow::callback::{call_completed, call_progress, FlowCallback, SharedCallback};
use crate::flow::error::FlowError;
use crate::flow::executable::ExecutableFlow;
use crate::flow::individual::pin_parent_props;
use crate::flow::status::Status;

/// Runs every child concurrently. The group succeeds when all children
/// finish without failure, fails as soon as any child fails, and reports
/// its terminal outcome to registered callbacks exactly once per run.
pub struct GroupedExecutableFlow {
    id: String,
    name: String,
    /// Declaration order, used for execution and return-props layering.
    flows: Vec<Arc<ExecutableFlow>>,
    /// Name-sorted view exposed as children.
    sorted_flows: Vec<Arc<ExecutableFlow>>,
    state: Arc<Mutex<GroupState>>,
}

struct GroupState {
    status: Status,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    parent_props: Option<Props>,
    return_props: Option<Props>,
    callbacks: Vec<SharedCallback>,
    exceptions: HashMap<String, Arc<anyhow::Error>>,
    /// Latch ensuring exactly one aggregate notification per run; replaced
    /// wholesale on reset so stragglers from the old run cannot fire it.
    notified: Arc<AtomicBool>,
}

impl Default for GroupState {
    fn default() -> Self {
        Self {
            status: Status::Ready,
            start_time: None,
            end_time: None,
            parent_props: None,
            return_props: None,
            callbacks: Vec::new(),
            exceptions: HashMap::new(),
            notified: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl GroupedExecutableFlow {
    pub fn new(id: impl Into<String>, flows: Vec<Arc<ExecutableFlow>>) -> Self {
        let name = flows
            .iter()
            .map(|f| f.name().to_string())
            .collect::<Vec<_>>()
            .join(" + ");
        let mut sorted_flows = flows.clone();
        sorted_flows.sort_by(|a, b| a.name().cmp(b.name()));

        let flow = Self {
            id: id.into(),
            name,
            flows,
            sorted_flows,
            state: Arc::new(Mutex::new(GroupState::default())),
        };
        flow.derive_initial_state();
        flow
    }

    /// Adopt a state consistent with children restored from a snapshot,
    /// re-attaching the group watch to any child still in flight.
    fn derive_initial_state(&self) {
        {
            let mut st = self.state.lock().unwrap();
            update_state_locked(&mut st, &self.flows);
        }

        let status = self.state.lock().unwrap().status;
        if status.is_terminal() {
            let mut st = self.state.lock().unwrap();
            st.start_time = self
                .flows
                .iter()
                .filter_map(|f| f.start_time())
                .min();
            st.end_time = self.flows.iter().filter_map(|f| f.end_time()).max();
            st.parent_props = self.flows.iter().find_map(|f| f.parent_props());
            // A restored terminal run has already notified its listeners.
            st.notified.store(true, Ordering::SeqCst);
        } else {
            let running: Vec<Arc<ExecutableFlow>> = self
                .flows
                .iter()
                .filter(|f| f.status() == Status::Running)
                .cloned()
                .collect();
            if running.is_empty() {
                return;
            }
            let props = running
                .iter()
                .find_map(|f| f.parent_props())
                .unwrap_or_default();
            let notified = {
                let mut st = self.state.lock().unwrap();
                st.status = Status::Running;
                st.start_time = self.flows.iter().filter_map(|f| f.start_time()).min();
                st.parent_props = Some(props.clone());
                Arc::clone(&st.notified)
            };
            for child in running {
                let watch = Arc::new(GroupWatch {
                    flows: self.flows.clone(),
                    state: Arc::clone(&self.state),
                    notified: Arc::clone(&notified),
                });
                if let Err(e) = child.execute(props.clone(), watch) {
                    log::error!(
                        "grouped flow [{}] failed to re-attach to child [{}]: {e}",
                        self.name,
                        child.name()
                    );
                }
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execute(&self, parent_props: Props, callback: SharedCallback) -> Result<(), FlowError> {
        enum Gate {
            Launch(Props, Arc<AtomicBool>),
            Enqueued,
            AlreadyDone(Status),
        }

        let gate = {
            let mut st = self.state.lock().unwrap();
            let current = st.status;
            pin_parent_props(&mut st.parent_props, current, &parent_props, &self.name)?;

            match st.status {
                Status::Ready => {
                    st.status = Status::Running;
                    if st.start_time.is_none() {
                        st.start_time = Some(Utc::now());
                    }
                    st.callbacks.push(callback.clone());
                    Gate::Launch(
                        st.parent_props.clone().unwrap_or_default(),
                        Arc::clone(&st.notified),
                    )
                }
                Status::Running => {
                    st.callbacks.push(callback.clone());
                    Gate::Enqueued
                }
                terminal => Gate::AlreadyDone(terminal.terminal_equivalent()),
            }
        };

        match gate {
            Gate::Launch(props, notified) => {
                for child in &self.flows {
                    // A child failure observed mid-launch makes further
                    // launches pointless.
                    if self.state.lock().unwrap().status == Status::Failed {
                        break;
                    }
                    let watch = Arc::new(GroupWatch {
                        flows: self.flows.clone(),
                        state: Arc::clone(&self.state),
                        notified: Arc::clone(&notified),
                    });
                    if let Err(e) = child.execute(props.clone(), watch) {
                        let callbacks = {
                            let mut st = self.state.lock().unwrap();
                            st.status = Status::Failed;
                            st.exceptions
                                .insert(child.name().to_string(), Arc::new(anyhow::anyhow!(e.to_string())));
                            if st.end_time.is_none() {
                                st.end_time = Some(Utc::now());
                            }
                            st.callbacks.clone()
                        };
                        if notified
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            call_completed(&callbacks, Status::Failed);
                        }
                        return Err(e);
                    }
                }
                Ok(())
            }
            Gate::Enqueued => Ok(()),
            Gate::AlreadyDone(status) => {
                callback.completed(status);
                Ok(())
            }
        }
    }

    pub fn cancel(&self) -> Result<bool, FlowError> {
        {
            let mut st = self.state.lock().unwrap();
            if !st.status.is_terminal() {
                st.status = Status::Failed;
            }
        }
        // Every child is attempted before any error is surfaced.
        let mut all_cancelled = true;
        let mut first_err = None;
        for child in &self.flows {
            match child.cancel() {
                Ok(cancelled) => all_cancelled &= cancelled,
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(all_cancelled),
        }
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    pub fn reset(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.status == Status::Running {
            return false;
        }
        *st = GroupState::default();
        true
    }

    pub fn mark_completed(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.status == Status::Running {
            return false;
        }
        st.status = Status::Completed;
        st.parent_props = Some(Props::new());
        st.return_props = Some(Props::new());
        true
    }

    pub fn children(&self) -> Vec<Arc<ExecutableFlow>> {
        self.sorted_flows.clone()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().end_time
    }

    pub fn parent_props(&self) -> Option<Props> {
        self.state.lock().unwrap().parent_props.clone()
    }

    pub fn return_props(&self) -> Option<Props> {
        self.state.lock().unwrap().return_props.clone()
    }

    pub fn exceptions(&self) -> HashMap<String, Arc<anyhow::Error>> {
        self.state.lock().unwrap().exceptions.clone()
    }
}

/// Recompute the aggregate status from the children. Any failed child
/// fails the group; all-finished succeeds it with children's return props
/// layered in declaration order (later children shadow earlier ones).
fn update_state_locked(st: &mut GroupState, flows: &[Arc<ExecutableFlow>]) {
    let mut all_finished = true;
    for child in flows {
        match child.status() {
            Status::Failed => {
                st.status = Status::Failed;
                st.return_props = Some(Props::new());
                return;
            }
            s if !s.is_terminal() => all_finished = false,
            _ => {}
        }
    }
    if all_finished {
        st.status = Status::Succeeded;
        let mut merged = Props::new();
        for child in flows {
            let returned = child.return_props().unwrap_or_default();
            merged = Props::layered(&merged, &returned);
        }
        st.return_props = Some(merged);
    }
}

struct GroupWatch {
    flows: Vec<Arc<ExecutableFlow>>,
    state: Arc<Mutex<GroupState>>,
    notified: Arc<AtomicBool>,
}

impl FlowCallback for GroupWatch {
    fn progress_made(&self) {
        let callbacks = self.state.lock().unwrap().callbacks.clone();
        call_progress(&callbacks);
    }

    fn completed(&self, _status: Status) {
        let (callbacks, aggregate) = {
            let mut st = self.state.lock().unwrap();
            update_state_locked(&mut st, &self.flows);
            (st.callbacks.clone(), st.status)
        };

        match aggregate {
            Status::Succeeded
                if self
                    .notified
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok() =>
            {
                let mut st = self.state.lock().unwrap();
                if st.end_time.is_none() {
                    st.end_time = Some(Utc::now());
                }
                drop(st);
                call_completed(&callbacks, Status::Succeeded);
            }
            Status::Failed
                if self
                    .notified
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok() =>
            {
                {
                    let mut st = self.state.lock().unwrap();
                    for child in &self.flows {
                        for (name, err) in child.exceptions() {
                            st.exceptions.insert(name, err);
                        }
                    }
                    if st.end_time.is_none() {
                        st.end_time = Some(Utc::now());
                    }
                }
                call_completed(&callbacks, Status::Failed);
            }
            _ => {
                // Either still running or a straggler from an already
                // notified run: forward progress only.
                call_progress(&callbacks);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::flow::testkit::{leaf, pool, wait, watch, TestFactory};
    use crate::jobs::job::JobFactory;

    fn group(
        names: &[&str],
        factory: &Arc<TestFactory>,
    ) -> GroupedExecutableFlow {
        let dyn_factory: Arc<dyn JobFactory> = Arc::clone(factory) as _;
        let pool = pool();
        let children = names
            .iter()
            .map(|n| leaf(n, &dyn_factory, &pool))
            .collect();
        GroupedExecutableFlow::new("1", children)
    }

    #[test]
    fn test_group_succeeds_when_all_children_do() {
        let factory = Arc::new(TestFactory::new());
        let flow = group(&["a", "b", "c"], &factory);
        assert_eq!(flow.name(), "a + b + c");

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        let mut ran = factory.run_log();
        ran.sort();
        assert_eq!(ran, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_any_child_failure_fails_the_group() {
        let factory = Arc::new(TestFactory::new().failing("b"));
        let flow = group(&["a", "b", "c"], &factory);

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Failed);
        assert!(flow.exceptions().contains_key("b"));
    }

    #[test]
    fn test_return_props_merge_with_later_children_shadowing() {
        let mut a_props = Props::new();
        a_props.put("shared", "from-a");
        a_props.put("only-a", "1");
        let mut b_props = Props::new();
        b_props.put("shared", "from-b");
        let factory = Arc::new(
            TestFactory::new()
                .generating("a", a_props)
                .generating("b", b_props),
        );
        let flow = group(&["a", "b"], &factory);

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        let merged = flow.return_props().unwrap();
        assert_eq!(merged.get("shared"), Some("from-b"));
        assert_eq!(merged.get("only-a"), Some("1"));
    }

    #[test]
    fn test_aggregate_completion_notifies_exactly_once() {
        struct Counter(AtomicUsize);
        impl FlowCallback for Counter {
            fn progress_made(&self) {}
            fn completed(&self, _status: Status) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let factory = Arc::new(TestFactory::new());
        let flow = group(&["a", "b", "c", "d"], &factory);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let (cb, rx) = watch();

        flow.execute(Props::new(), counter.clone()).unwrap();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        // The aggregate notification may still be in flight on the thread
        // that won the latch.
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_children_are_exposed_name_sorted() {
        let factory = Arc::new(TestFactory::new());
        let flow = group(&["c", "a", "b"], &factory);
        let children = flow.children();
        let names: Vec<&str> = children.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
