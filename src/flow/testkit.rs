//! Shared helpers for flow tests.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::props::Props;
use crate::common::worker_pool::WorkerPool;
use crate::flow::callback::FlowCallback;
use crate::flow::executable::ExecutableFlow;
use crate::flow::individual::IndividualJobExecutableFlow;
use crate::flow::status::Status;
use crate::jobs::job::{Job, JobFactory};

pub(crate) fn pool() -> Arc<WorkerPool> {
    Arc::new(WorkerPool::new(4))
}

struct TestJob {
    name: String,
    fail: bool,
    props: Props,
    runs: Arc<Mutex<Vec<String>>>,
}

impl Job for TestJob {
    fn id(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), anyhow::Error> {
        self.runs.lock().unwrap().push(self.name.clone());
        if self.fail {
            Err(anyhow::anyhow!("job [{}] was told to fail", self.name))
        } else {
            Ok(())
        }
    }

    fn generated_properties(&self) -> Props {
        self.props.clone()
    }
}

/// Produces jobs that record every run and can be told to fail or to
/// generate properties, per job name.
pub(crate) struct TestFactory {
    failing: HashSet<String>,
    generated: HashMap<String, Props>,
    runs: Arc<Mutex<Vec<String>>>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            generated: HashMap::new(),
            runs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn generating(mut self, name: &str, props: Props) -> Self {
        self.generated.insert(name.to_string(), props);
        self
    }

    /// Names of the jobs run so far, in run order.
    pub fn run_log(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

impl JobFactory for TestFactory {
    fn load_job(&self, name: &str, _parent_props: &Props) -> Result<Arc<dyn Job>, anyhow::Error> {
        Ok(Arc::new(TestJob {
            name: name.to_string(),
            fail: self.failing.contains(name),
            props: self.generated.get(name).cloned().unwrap_or_default(),
            runs: Arc::clone(&self.runs),
        }))
    }
}

/// A factory whose single job blocks until the returned sender fires.
pub(crate) struct BlockingFactory {
    gate: Mutex<Option<Receiver<()>>>,
}

pub(crate) fn blocking_factory() -> (Arc<BlockingFactory>, Sender<()>) {
    let (tx, rx) = channel();
    (
        Arc::new(BlockingFactory {
            gate: Mutex::new(Some(rx)),
        }),
        tx,
    )
}

struct BlockingJob {
    name: String,
    gate: Mutex<Option<Receiver<()>>>,
}

impl Job for BlockingJob {
    fn id(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), anyhow::Error> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        Ok(())
    }
}

impl JobFactory for BlockingFactory {
    fn load_job(&self, name: &str, _parent_props: &Props) -> Result<Arc<dyn Job>, anyhow::Error> {
        Ok(Arc::new(BlockingJob {
            name: name.to_string(),
            gate: Mutex::new(self.gate.lock().unwrap().take()),
        }))
    }
}

/// Callback that forwards completion statuses into a channel.
pub(crate) struct Watch {
    tx: Sender<Status>,
}

pub(crate) fn watch() -> (Arc<Watch>, Receiver<Status>) {
    let (tx, rx) = channel();
    (Arc::new(Watch { tx }), rx)
}

impl FlowCallback for Watch {
    fn progress_made(&self) {}

    fn completed(&self, status: Status) {
        let _ = self.tx.send(status);
    }
}

pub(crate) fn wait(rx: &Receiver<Status>) -> Status {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("flow did not complete in time")
}

pub(crate) fn leaf(
    name: &str,
    factory: &Arc<dyn JobFactory>,
    pool: &Arc<WorkerPool>,
) -> Arc<ExecutableFlow> {
    Arc::new(ExecutableFlow::Individual(IndividualJobExecutableFlow::new(
        "1",
        name,
        Arc::clone(factory),
        Arc::clone(pool),
    )))
}
