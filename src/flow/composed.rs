//! Sequential dependency: dependee runs to success before the depender.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::common::props::Props;
use crate::flow::callback::{call_completed, FlowCallback, SharedCallback};
use crate::flow::error::FlowError;
use crate::flow::executable::ExecutableFlow;
use crate::flow::individual::pin_parent_props;
use crate::flow::status::Status;

/// Runs `dependee`, and only upon its success runs `depender` with the
/// dependee's return props layered over the parent props. A dependee
/// failure short-circuits the composition to FAILED.
pub struct ComposedExecutableFlow {
    id: String,
    depender: Arc<ExecutableFlow>,
    dependee: Arc<ExecutableFlow>,
    /// Keys stripped from the dependee's return props before they are
    /// handed to the depender.
    filtered_keys: Vec<String>,
    state: Arc<Mutex<ComposedState>>,
}

#[derive(Default)]
struct ComposedState {
    status: Option<Status>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    parent_props: Option<Props>,
    callbacks: Vec<SharedCallback>,
    exceptions: HashMap<String, Arc<anyhow::Error>>,
}

impl ComposedState {
    fn status(&self) -> Status {
        self.status.unwrap_or(Status::Ready)
    }
}

impl ComposedExecutableFlow {
    pub fn new(
        id: impl Into<String>,
        depender: Arc<ExecutableFlow>,
        dependee: Arc<ExecutableFlow>,
    ) -> Self {
        Self::with_filtered_keys(id, depender, dependee, Vec::new())
    }

    /// Like `new`, but strips `filtered_keys` from the dependee's return
    /// props before the depender sees them.
    pub fn with_filtered_keys(
        id: impl Into<String>,
        depender: Arc<ExecutableFlow>,
        dependee: Arc<ExecutableFlow>,
        filtered_keys: Vec<String>,
    ) -> Self {
        let flow = Self {
            id: id.into(),
            depender,
            dependee,
            filtered_keys,
            state: Arc::new(Mutex::new(ComposedState::default())),
        };
        flow.derive_initial_state();
        flow
    }

    /// A composition built over children restored from a snapshot adopts a
    /// state consistent with theirs, and re-attaches its internal callbacks
    /// to any child still in flight.
    fn derive_initial_state(&self) {
        let depender_status = self.depender.status();
        let dependee_status = self.dependee.status();

        match depender_status {
            Status::Ready => match dependee_status {
                Status::Ready => {}
                Status::Running => {
                    let props = self.dependee.parent_props().unwrap_or_default();
                    {
                        let mut st = self.state.lock().unwrap();
                        st.status = Some(Status::Running);
                        st.start_time = self.dependee.start_time();
                        st.parent_props = Some(props.clone());
                    }
                    self.attach_dependee_watch(props);
                }
                Status::Succeeded | Status::Completed => {
                    let mut st = self.state.lock().unwrap();
                    st.start_time = self.dependee.start_time();
                    st.parent_props = self.dependee.parent_props();
                }
                Status::Failed => {
                    let mut st = self.state.lock().unwrap();
                    st.status = Some(Status::Failed);
                    st.start_time = self.dependee.start_time();
                    st.end_time = self.dependee.end_time();
                    st.parent_props = self.dependee.parent_props();
                }
            },
            Status::Running => {
                let props = self.dependee.parent_props().unwrap_or_default();
                {
                    let mut st = self.state.lock().unwrap();
                    st.status = Some(Status::Running);
                    st.start_time = self.dependee.start_time().or(self.depender.start_time());
                    st.parent_props = Some(props.clone());
                }
                self.attach_depender_watch();
            }
            terminal => {
                let mut st = self.state.lock().unwrap();
                st.status = Some(terminal);
                st.start_time = self.dependee.start_time().or(self.depender.start_time());
                st.end_time = self.depender.end_time();
                st.parent_props = self.dependee.parent_props();
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.depender.name()
    }

    pub fn execute(&self, parent_props: Props, callback: SharedCallback) -> Result<(), FlowError> {
        enum Gate {
            Launch(Props),
            Enqueued,
            AlreadyDone(Status),
        }

        let gate = {
            let mut st = self.state.lock().unwrap();
            let current = st.status();
            pin_parent_props(&mut st.parent_props, current, &parent_props, self.name())?;

            match st.status() {
                Status::Ready => {
                    st.status = Some(Status::Running);
                    if st.start_time.is_none() {
                        st.start_time = Some(Utc::now());
                    }
                    st.callbacks.push(callback.clone());
                    Gate::Launch(st.parent_props.clone().unwrap_or_default())
                }
                Status::Running => {
                    st.callbacks.push(callback.clone());
                    Gate::Enqueued
                }
                terminal => Gate::AlreadyDone(terminal.terminal_equivalent()),
            }
        };

        match gate {
            Gate::Launch(props) => {
                if let Err(e) = self.try_attach_dependee(props) {
                    self.fail_with(anyhow::anyhow!(e.to_string()));
                    return Err(e);
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

    fn try_attach_dependee(&self, props: Props) -> Result<(), FlowError> {
        let watch = Arc::new(DependeeWatch {
            flow: FlowHandle::from(self),
            props: props.clone(),
        });
        self.dependee.execute(props, watch)
    }

    fn attach_dependee_watch(&self, props: Props) {
        if let Err(e) = self.try_attach_dependee(props) {
            self.fail_with(anyhow::anyhow!(e.to_string()));
        }
    }

    fn attach_depender_watch(&self) {
        let base = self.dependee.parent_props().unwrap_or_default();
        let returned = self.dependee.return_props().unwrap_or_default();
        let props = self.layer_dependee_props(&base, &returned);
        let watch = Arc::new(DependerWatch {
            flow: FlowHandle::from(self),
        });
        if let Err(e) = self.depender.execute(props, watch) {
            self.fail_with(anyhow::anyhow!(e.to_string()));
        }
    }

    fn layer_dependee_props(&self, base: &Props, returned: &Props) -> Props {
        let filtered: Vec<&str> = self.filtered_keys.iter().map(String::as_str).collect();
        Props::layered(base, &returned.without_keys(&filtered))
    }

    fn fail_with(&self, error: anyhow::Error) {
        let callbacks = {
            let mut st = self.state.lock().unwrap();
            st.status = Some(Status::Failed);
            st.exceptions.insert(self.name().to_string(), Arc::new(error));
            if st.end_time.is_none() {
                st.end_time = Some(Utc::now());
            }
            st.callbacks.clone()
        };
        call_completed(&callbacks, Status::Failed);
    }

    pub fn cancel(&self) -> Result<bool, FlowError> {
        {
            let mut st = self.state.lock().unwrap();
            if !st.status().is_terminal() {
                st.status = Some(Status::Failed);
            }
        }
        // Both children are always attempted, even if one errors.
        let depender_res = self.depender.cancel();
        let dependee_res = self.dependee.cancel();
        Ok(depender_res? && dependee_res?)
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status()
    }

    pub fn reset(&self) -> bool {
        {
            let mut st = self.state.lock().unwrap();
            if st.status() == Status::Running {
                return false;
            }
            *st = ComposedState::default();
        }
        self.depender.reset()
    }

    pub fn mark_completed(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.status() == Status::Running {
            return false;
        }
        st.status = Some(Status::Completed);
        st.parent_props = Some(Props::new());
        true
    }

    pub fn children(&self) -> Vec<Arc<ExecutableFlow>> {
        vec![Arc::clone(&self.dependee)]
    }

    pub(crate) fn depender(&self) -> &Arc<ExecutableFlow> {
        &self.depender
    }

    pub(crate) fn dependee(&self) -> &Arc<ExecutableFlow> {
        &self.dependee
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
        let dependee = self.dependee.return_props().unwrap_or_default();
        let depender = self.depender.return_props().unwrap_or_default();
        Some(Props::layered(&dependee, &depender))
    }

    pub fn exceptions(&self) -> HashMap<String, Arc<anyhow::Error>> {
        self.state.lock().unwrap().exceptions.clone()
    }
}

/// Weakens the borrow of the owning composition so inner callbacks can
/// outlive the stack frame that registered them.
#[derive(Clone)]
struct FlowHandle {
    depender: Arc<ExecutableFlow>,
    dependee: Arc<ExecutableFlow>,
    filtered_keys: Vec<String>,
    name: String,
    state: Arc<Mutex<ComposedState>>,
}

impl From<&ComposedExecutableFlow> for FlowHandle {
    fn from(flow: &ComposedExecutableFlow) -> Self {
        Self {
            depender: Arc::clone(&flow.depender),
            dependee: Arc::clone(&flow.dependee),
            filtered_keys: flow.filtered_keys.clone(),
            name: flow.name().to_string(),
            state: Arc::clone(&flow.state),
        }
    }
}

struct DependeeWatch {
    flow: FlowHandle,
    props: Props,
}

impl FlowCallback for DependeeWatch {
    fn progress_made(&self) {
        let callbacks = self.flow.state.lock().unwrap().callbacks.clone();
        crate::flow::callback::call_progress(&callbacks);
    }

    fn completed(&self, status: Status) {
        match status.terminal_equivalent() {
            Status::Succeeded => {
                // The dependee phase is done; externals (persistence among
                // them) hear about it before the depender starts.
                let callbacks = self.flow.state.lock().unwrap().callbacks.clone();
                crate::flow::callback::call_progress(&callbacks);

                let returned = self.flow.dependee.return_props().unwrap_or_default();
                let filtered: Vec<&str> =
                    self.flow.filtered_keys.iter().map(String::as_str).collect();
                let props = Props::layered(&self.props, &returned.without_keys(&filtered));
                let watch = Arc::new(DependerWatch {
                    flow: self.flow.clone(),
                });
                if let Err(e) = self.flow.depender.execute(props, watch) {
                    fail_handle(&self.flow, anyhow::anyhow!(e.to_string()));
                }
            }
            _ => {
                let callbacks = {
                    let mut st = self.flow.state.lock().unwrap();
                    st.status = Some(Status::Failed);
                    for (name, err) in self.flow.dependee.exceptions() {
                        st.exceptions.insert(name, err);
                    }
                    if st.end_time.is_none() {
                        st.end_time = Some(Utc::now());
                    }
                    st.callbacks.clone()
                };
                call_completed(&callbacks, Status::Failed);
            }
        }
    }
}

struct DependerWatch {
    flow: FlowHandle,
}

impl FlowCallback for DependerWatch {
    fn progress_made(&self) {
        let callbacks = self.flow.state.lock().unwrap().callbacks.clone();
        crate::flow::callback::call_progress(&callbacks);
    }

    fn completed(&self, status: Status) {
        let callbacks = {
            let mut st = self.flow.state.lock().unwrap();
            st.status = Some(status.terminal_equivalent());
            if st.status() == Status::Failed {
                for (name, err) in self.flow.depender.exceptions() {
                    st.exceptions.insert(name, err);
                }
            }
            if st.end_time.is_none() {
                st.end_time = Some(Utc::now());
            }
            st.callbacks.clone()
        };
        call_completed(&callbacks, status.terminal_equivalent());
    }
}

fn fail_handle(handle: &FlowHandle, error: anyhow::Error) {
    let callbacks = {
        let mut st = handle.state.lock().unwrap();
        st.status = Some(Status::Failed);
        st.exceptions.insert(handle.name.clone(), Arc::new(error));
        if st.end_time.is_none() {
            st.end_time = Some(Utc::now());
        }
        st.callbacks.clone()
    };
    call_completed(&callbacks, Status::Failed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testkit::{leaf, pool, wait, watch, TestFactory};
    use crate::jobs::job::JobFactory;

    #[test]
    fn test_dependee_runs_before_depender() {
        let factory = Arc::new(TestFactory::new());
        let dyn_factory: Arc<dyn JobFactory> = Arc::clone(&factory) as _;
        let pool = pool();
        let flow = ComposedExecutableFlow::new(
            "1",
            leaf("depender", &dyn_factory, &pool),
            leaf("dependee", &dyn_factory, &pool),
        );

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);
        assert_eq!(factory.run_log(), vec!["dependee", "depender"]);
    }

    #[test]
    fn test_dependee_success_notifies_progress_before_depender() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::mpsc::{channel, Sender};

        struct ProgressWatch {
            progress: AtomicUsize,
            done: Sender<Status>,
        }

        impl crate::flow::callback::FlowCallback for ProgressWatch {
            fn progress_made(&self) {
                self.progress.fetch_add(1, Ordering::SeqCst);
            }

            fn completed(&self, status: Status) {
                let _ = self.done.send(status);
            }
        }

        let factory = Arc::new(TestFactory::new());
        let dyn_factory: Arc<dyn JobFactory> = Arc::clone(&factory) as _;
        let pool = pool();
        let flow = ComposedExecutableFlow::new(
            "1",
            leaf("depender", &dyn_factory, &pool),
            leaf("dependee", &dyn_factory, &pool),
        );

        let (tx, rx) = channel();
        let cb = Arc::new(ProgressWatch {
            progress: AtomicUsize::new(0),
            done: tx,
        });
        flow.execute(Props::new(), Arc::clone(&cb) as _).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);
        // One phase boundary: the dependee finishing must be reported so
        // external listeners can checkpoint before the depender runs.
        assert_eq!(cb.progress.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dependee_failure_short_circuits() {
        let factory = Arc::new(TestFactory::new().failing("dependee"));
        let dyn_factory: Arc<dyn JobFactory> = Arc::clone(&factory) as _;
        let pool = pool();
        let flow = ComposedExecutableFlow::new(
            "1",
            leaf("depender", &dyn_factory, &pool),
            leaf("dependee", &dyn_factory, &pool),
        );

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Failed);
        assert_eq!(factory.run_log(), vec!["dependee"]);
        assert!(flow.exceptions().contains_key("dependee"));
    }

    #[test]
    fn test_dependee_return_props_reach_the_depender() {
        let mut generated = Props::new();
        generated.put("built", "yes");
        let factory = Arc::new(TestFactory::new().generating("dependee", generated));
        let dyn_factory: Arc<dyn JobFactory> = Arc::clone(&factory) as _;
        let pool = pool();
        let flow = ComposedExecutableFlow::new(
            "1",
            leaf("depender", &dyn_factory, &pool),
            leaf("dependee", &dyn_factory, &pool),
        );

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        let seen = flow.depender().parent_props().unwrap();
        assert_eq!(seen.get("built"), Some("yes"));
        assert_eq!(flow.return_props().unwrap().get("built"), Some("yes"));
    }

    #[test]
    fn test_filtered_keys_are_stripped_from_dependee_props() {
        let mut generated = Props::new();
        generated.put("kept", "1");
        generated.put("dropped", "2");
        let factory = Arc::new(TestFactory::new().generating("dependee", generated));
        let dyn_factory: Arc<dyn JobFactory> = Arc::clone(&factory) as _;
        let pool = pool();
        let flow = ComposedExecutableFlow::with_filtered_keys(
            "1",
            leaf("depender", &dyn_factory, &pool),
            leaf("dependee", &dyn_factory, &pool),
            vec!["dropped".to_string()],
        );

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        let seen = flow.depender().parent_props().unwrap();
        assert_eq!(seen.get("kept"), Some("1"));
        assert_eq!(seen.get("dropped"), None);
    }

    #[test]
    fn test_reset_after_failure_resets_both_sides() {
        let factory = Arc::new(TestFactory::new().failing("dependee"));
        let dyn_factory: Arc<dyn JobFactory> = Arc::clone(&factory) as _;
        let pool = pool();
        let flow = ComposedExecutableFlow::new(
            "1",
            leaf("depender", &dyn_factory, &pool),
            leaf("dependee", &dyn_factory, &pool),
        );

        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Failed);

        crate::flow::reset_failed_flows(&flow.children()[0]);
        assert!(flow.reset());
        assert_eq!(flow.status(), Status::Ready);
    }
}
