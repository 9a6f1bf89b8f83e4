//! Leaf executable flow: runs exactly one job.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::common::props::Props;
use crate::common::worker_pool::WorkerPool;
use crate::flow::callback::{call_completed, SharedCallback};
use crate::flow::error::FlowError;
use crate::flow::status::Status;
use crate::jobs::job::{Job, JobFactory};

/// An executable flow that wraps a single job.
///
/// `execute()` is non-blocking: the job body runs on the worker pool and
/// completion is observed only through callbacks. Only one launch can ever
/// happen per run; concurrent callers attach their callbacks to the run in
/// flight.
pub struct IndividualJobExecutableFlow {
    id: String,
    name: String,
    factory: Arc<dyn JobFactory>,
    pool: Arc<WorkerPool>,
    state: Arc<Mutex<LeafState>>,
}

#[derive(Default)]
struct LeafState {
    status: Option<Status>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    parent_props: Option<Props>,
    return_props: Option<Props>,
    callbacks: Vec<SharedCallback>,
    exceptions: HashMap<String, Arc<anyhow::Error>>,
    job: Option<Arc<dyn Job>>,
}

impl LeafState {
    fn status(&self) -> Status {
        self.status.unwrap_or(Status::Ready)
    }

    fn clear(&mut self) {
        *self = LeafState::default();
    }
}

enum Gate {
    Launch(Props),
    Enqueued,
    AlreadyDone(Status),
}

impl IndividualJobExecutableFlow {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        factory: Arc<dyn JobFactory>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            factory,
            pool,
            state: Arc::new(Mutex::new(LeafState::default())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execute(&self, parent_props: Props, callback: SharedCallback) -> Result<(), FlowError> {
        let gate = {
            let mut st = self.state.lock().unwrap();
            let current = st.status();
            pin_parent_props(&mut st.parent_props, current, &parent_props, &self.name)?;

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
                self.launch(props);
                Ok(())
            }
            Gate::Enqueued => Ok(()),
            Gate::AlreadyDone(status) => {
                // Lock already released; synchronous synthetic completion.
                callback.completed(status);
                Ok(())
            }
        }
    }

    /// Only one caller can ever get here per run; the READY->RUNNING gate
    /// in `execute()` guarantees it.
    fn launch(&self, parent_props: Props) {
        let job = match self.factory.load_job(&self.name, &parent_props) {
            Ok(job) => job,
            Err(e) => {
                log::warn!(
                    "Job [{}] could not be loaded but was supposed to run. \
                     Perhaps someone changed the flow? {e:#}",
                    self.name
                );
                let callbacks = {
                    let mut st = self.state.lock().unwrap();
                    st.status = Some(Status::Failed);
                    st.return_props = Some(Props::new());
                    st.exceptions.insert(self.name.clone(), Arc::new(e));
                    if st.end_time.is_none() {
                        st.end_time = Some(Utc::now());
                    }
                    st.callbacks.clone()
                };
                call_completed(&callbacks, Status::Failed);
                return;
            }
        };

        {
            let mut st = self.state.lock().unwrap();
            st.job = Some(Arc::clone(&job));
        }

        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        self.pool.run_job(move || {
            let result = catch_unwind(AssertUnwindSafe(|| job.run()));
            let result = match result {
                Ok(r) => r,
                Err(_) => Err(anyhow::anyhow!("job [{name}] panicked during run()")),
            };

            let (callbacks, status) = {
                let mut st = state.lock().unwrap();
                if st.status() != Status::Running {
                    // Cancelled while running; the cancel path already
                    // notified everyone.
                    return;
                }
                match result {
                    Ok(()) => {
                        st.status = Some(Status::Succeeded);
                        st.return_props = Some(job.generated_properties());
                    }
                    Err(e) => {
                        log::error!("Job [{name}] failed: {e:#}");
                        st.status = Some(Status::Failed);
                        st.return_props = Some(Props::new());
                        st.exceptions.insert(name.clone(), Arc::new(e));
                    }
                }
                if st.end_time.is_none() {
                    st.end_time = Some(Utc::now());
                }
                (st.callbacks.clone(), st.status())
            };

            call_completed(&callbacks, status);
        });
    }

    pub fn cancel(&self) -> Result<bool, FlowError> {
        let (callbacks, job) = {
            let mut st = self.state.lock().unwrap();
            if st.status().is_terminal() {
                return Ok(true);
            }
            st.status = Some(Status::Failed);
            st.return_props = Some(Props::new());
            if st.end_time.is_none() {
                st.end_time = Some(Utc::now());
            }
            (std::mem::take(&mut st.callbacks), st.job.clone())
        };

        call_completed(&callbacks, Status::Failed);

        if let Some(job) = job {
            job.cancel().map_err(|e| FlowError::CancelFailed {
                name: self.name.clone(),
                source: e,
            })?;
        }
        Ok(true)
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status()
    }

    pub fn reset(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.status() == Status::Running {
            return false;
        }
        st.clear();
        true
    }

    pub fn mark_completed(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.status() == Status::Running {
            return false;
        }
        st.status = Some(Status::Completed);
        st.parent_props = Some(Props::new());
        st.return_props = Some(Props::new());
        true
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

    /// Restore persisted state onto a freshly-built node. Used by the
    /// snapshot loader only.
    pub(crate) fn restore(
        &self,
        status: Status,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        parent_props: Option<Props>,
        return_props: Option<Props>,
    ) {
        let mut st = self.state.lock().unwrap();
        st.status = Some(status);
        st.start_time = start_time;
        st.end_time = end_time;
        st.parent_props = parent_props;
        st.return_props = return_props;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::testkit::{blocking_factory, pool, watch, wait, TestFactory};

    fn leaf(name: &str, factory: Arc<dyn JobFactory>) -> IndividualJobExecutableFlow {
        IndividualJobExecutableFlow::new("1", name, factory, pool())
    }

    #[test]
    fn test_successful_run_reports_and_records() {
        let factory = Arc::new(TestFactory::new());
        let flow = leaf("a", Arc::clone(&factory) as _);
        let (cb, rx) = watch();

        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);
        assert_eq!(flow.status(), Status::Succeeded);
        assert_eq!(factory.run_log(), vec!["a"]);
        assert!(flow.start_time().is_some());
        assert!(flow.end_time().is_some());
        assert!(flow.return_props().is_some());
    }

    #[test]
    fn test_generated_properties_become_return_props() {
        let mut generated = Props::new();
        generated.put("built", "yes");
        let factory = Arc::new(TestFactory::new().generating("a", generated));
        let flow = leaf("a", factory as _);
        let (cb, rx) = watch();

        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);
        assert_eq!(
            flow.return_props().unwrap().get("built"),
            Some("yes")
        );
    }

    #[test]
    fn test_failure_records_exception() {
        let factory = Arc::new(TestFactory::new().failing("a"));
        let flow = leaf("a", factory as _);
        let (cb, rx) = watch();

        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Failed);
        assert!(flow.exceptions().contains_key("a"));
    }

    #[test]
    fn test_late_caller_gets_synthetic_completion_without_rerun() {
        let factory = Arc::new(TestFactory::new());
        let flow = leaf("a", Arc::clone(&factory) as _);
        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        let (cb2, rx2) = watch();
        flow.execute(Props::new(), cb2).unwrap();
        assert_eq!(wait(&rx2), Status::Succeeded);
        assert_eq!(factory.run_log().len(), 1);
    }

    #[test]
    fn test_mismatched_props_rejected() {
        let factory = Arc::new(TestFactory::new());
        let flow = leaf("a", factory as _);
        let mut first = Props::new();
        first.put("x", "1");
        let (cb, rx) = watch();
        flow.execute(first, cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        let mut other = Props::new();
        other.put("x", "2");
        let (cb2, _rx2) = watch();
        let err = flow.execute(other, cb2).unwrap_err();
        assert!(matches!(err, FlowError::PropsMismatch { .. }));
    }

    #[test]
    fn test_mark_completed_accepts_any_props() {
        let factory = Arc::new(TestFactory::new());
        let flow = leaf("a", Arc::clone(&factory) as _);
        assert!(flow.mark_completed());

        let mut props = Props::new();
        props.put("anything", "goes");
        let (cb, rx) = watch();
        flow.execute(props, cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);
        assert!(factory.run_log().is_empty());
    }

    #[test]
    fn test_cancel_while_running_notifies_failed() {
        let (factory, release) = blocking_factory();
        let flow = leaf("a", factory as _);
        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();

        assert!(flow.cancel().unwrap());
        assert_eq!(wait(&rx), Status::Failed);
        assert_eq!(flow.status(), Status::Failed);
        let _ = release.send(());
    }

    #[test]
    fn test_reset_allows_a_second_run() {
        let factory = Arc::new(TestFactory::new());
        let flow = leaf("a", Arc::clone(&factory) as _);
        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Succeeded);

        assert!(flow.reset());
        assert_eq!(flow.status(), Status::Ready);
        let (cb2, rx2) = watch();
        flow.execute(Props::new(), cb2).unwrap();
        assert_eq!(wait(&rx2), Status::Succeeded);
        assert_eq!(factory.run_log().len(), 2);
    }

    #[test]
    fn test_factory_failure_fails_the_flow() {
        struct RefusingFactory;
        impl JobFactory for RefusingFactory {
            fn load_job(
                &self,
                _name: &str,
                _props: &Props,
            ) -> Result<Arc<dyn Job>, anyhow::Error> {
                Err(anyhow::anyhow!("no such job"))
            }
        }

        let flow = leaf("a", Arc::new(RefusingFactory) as _);
        let (cb, rx) = watch();
        flow.execute(Props::new(), cb).unwrap();
        assert_eq!(wait(&rx), Status::Failed);
        assert!(flow.exceptions().contains_key("a"));
    }
}

/// Shared props-pinning rule: the first executing caller's props stick; a
/// later caller must present equal props unless the node was short-circuited
/// to COMPLETED.
pub(crate) fn pin_parent_props(
    pinned: &mut Option<Props>,
    status: Status,
    given: &Props,
    flow_name: &str,
) -> Result<(), FlowError> {
    match pinned {
        None => {
            *pinned = Some(given.clone());
            Ok(())
        }
        Some(existing) => {
            if status != Status::Completed && !existing.equals_props(given) {
                Err(FlowError::PropsMismatch {
                    flow: flow_name.to_string(),
                    pinned: existing.to_string(),
                    given: given.to_string(),
                })
            } else {
                Ok(())
            }
        }
    }
}
