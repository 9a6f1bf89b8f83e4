//! Immediate flow execution: executing/completed bookkeeping, persistence
//! on progress, and completion notification.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Timelike, Utc};
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::common::files::tail_file;
use crate::common::mailer::{send_email_if_possible, Mailman};
use crate::common::props::Props;
use crate::flow::callback::FlowCallback;
use crate::flow::error::FlowError;
use crate::flow::executable::ExecutableFlow;
use crate::flow::manager::FlowManager;
use crate::flow::serialization::FlowExecutionHolder;
use crate::flow::status::Status;
use crate::jobs::manager::JobManager;

/// Keys stamped onto every execution's parent props.
pub const FLOW_ID_PROP: &str = "jobflow.flow.id";
pub const FLOW_UUID_PROP: &str = "jobflow.flow.uuid";
pub const FLOW_START_PREFIX: &str = "jobflow.flow.start";

/// Lines of the job log included in a failure email.
const LOG_TAIL_LINES: usize = 60;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("a flow named [{0}] is already executing")]
    AlreadyRunning(String),

    #[error("no flow named [{0}]")]
    UnknownFlow(String),

    #[error("flow [{0}] is not executing")]
    NotRunning(String),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// One past or present run of a named flow.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: String,
    pub name: String,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub status: Status,
}

struct ExecutingFlow {
    flow: Arc<ExecutableFlow>,
    record: ExecutionRecord,
}

struct ExecutorInner {
    flow_manager: Arc<dyn FlowManager>,
    job_manager: Arc<JobManager>,
    mailman: Arc<dyn Mailman>,
    default_sender: Option<String>,
    default_recipients: Vec<String>,
    executing: DashMap<String, ExecutingFlow>,
    completed: Mutex<Vec<ExecutionRecord>>,
}

/// Drives executions that are not time-scheduled, and owns the
/// executing/completed bookkeeping the scheduler also reports into.
#[derive(Clone)]
pub struct JobExecutorManager {
    inner: Arc<ExecutorInner>,
}

impl JobExecutorManager {
    pub fn new(
        flow_manager: Arc<dyn FlowManager>,
        job_manager: Arc<JobManager>,
        mailman: Arc<dyn Mailman>,
        default_sender: Option<String>,
        default_recipients: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                flow_manager,
                job_manager,
                mailman,
                default_sender,
                default_recipients,
                executing: DashMap::new(),
                completed: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Instantiate and start the named flow. One execution per name at a
    /// time; a name already in flight is rejected.
    pub fn execute_by_name(&self, name: &str, ignore_deps: bool) -> Result<(), ExecutionError> {
        self.execute_with_hook(name, ignore_deps, None)
    }

    /// Like `execute_by_name`, with a hook invoked after the run's
    /// bookkeeping and notification are done. The scheduler uses the hook
    /// to re-register recurring runs.
    pub fn execute_with_hook(
        &self,
        name: &str,
        ignore_deps: bool,
        on_complete: Option<Box<dyn Fn(Status) + Send + Sync>>,
    ) -> Result<(), ExecutionError> {
        if self.inner.executing.contains_key(name) {
            return Err(ExecutionError::AlreadyRunning(name.to_string()));
        }
        let flow = self
            .inner
            .flow_manager
            .create_new_executable_flow(name)
            .ok_or_else(|| ExecutionError::UnknownFlow(name.to_string()))?;
        self.execute_flow(flow, ignore_deps, on_complete)
    }

    /// Start an already instantiated tree.
    pub fn execute_flow(
        &self,
        flow: Arc<ExecutableFlow>,
        ignore_deps: bool,
        on_complete: Option<Box<dyn Fn(Status) + Send + Sync>>,
    ) -> Result<(), ExecutionError> {
        let name = flow.name().to_string();
        if self.inner.executing.contains_key(&name) {
            return Err(ExecutionError::AlreadyRunning(name));
        }

        if ignore_deps {
            for child in flow.children() {
                if !child.mark_completed() {
                    log::warn!(
                        "dependency [{}] of [{}] refused mark_completed; it is running",
                        child.name(),
                        name
                    );
                }
            }
        }

        let started = Utc::now();
        let props = execution_props(&flow, started);
        let record = ExecutionRecord {
            id: flow.id().to_string(),
            name: name.clone(),
            started,
            ended: None,
            status: Status::Running,
        };
        self.inner.executing.insert(
            name.clone(),
            ExecutingFlow {
                flow: Arc::clone(&flow),
                record,
            },
        );

        let holder = Arc::new(FlowExecutionHolder::new(Arc::clone(&flow), props.clone()));
        save_quietly(&self.inner.flow_manager, &holder);

        let callback = Arc::new(ExecutionWatch {
            inner: Arc::clone(&self.inner),
            holder,
            name: name.clone(),
            on_complete,
        });

        if let Err(e) = flow.execute(props, callback) {
            self.inner.executing.remove(&name);
            return Err(e.into());
        }
        Ok(())
    }

    /// Cancel the running execution for `name`.
    pub fn cancel(&self, name: &str) -> Result<(), ExecutionError> {
        let flow = self
            .inner
            .executing
            .get(name)
            .map(|e| Arc::clone(&e.flow))
            .ok_or_else(|| ExecutionError::NotRunning(name.to_string()))?;
        flow.cancel()?;
        Ok(())
    }

    pub fn is_executing(&self, name: &str) -> bool {
        self.inner.executing.contains_key(name)
    }

    pub fn executing(&self) -> Vec<ExecutionRecord> {
        self.inner
            .executing
            .iter()
            .map(|e| e.value().record.clone())
            .collect()
    }

    /// Full completion history, oldest first.
    pub fn completed(&self) -> Vec<ExecutionRecord> {
        self.inner.completed.lock().unwrap().clone()
    }

    pub fn completed_for(&self, name: &str) -> Vec<ExecutionRecord> {
        self.inner
            .completed
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.name == name)
            .cloned()
            .collect()
    }
}

/// Props every run starts with: execution id, a fresh UUID, and the start
/// timestamp broken into components, all under the `jobflow.flow.` prefix.
fn execution_props(flow: &Arc<ExecutableFlow>, started: DateTime<Utc>) -> Props {
    let mut props = Props::new();
    props.put(FLOW_ID_PROP, flow.id());
    props.put(FLOW_UUID_PROP, Uuid::new_v4().to_string());
    props.put(format!("{FLOW_START_PREFIX}.timestamp"), started.to_rfc3339());
    props.put(format!("{FLOW_START_PREFIX}.year"), started.year().to_string());
    props.put(format!("{FLOW_START_PREFIX}.month"), started.month().to_string());
    props.put(format!("{FLOW_START_PREFIX}.day"), started.day().to_string());
    props.put(format!("{FLOW_START_PREFIX}.hour"), started.hour().to_string());
    props.put(format!("{FLOW_START_PREFIX}.minute"), started.minute().to_string());
    props.put(format!("{FLOW_START_PREFIX}.second"), started.second().to_string());
    props.put(
        format!("{FLOW_START_PREFIX}.milliseconds"),
        started.timestamp_subsec_millis().to_string(),
    );
    props
}

fn save_quietly(flow_manager: &Arc<dyn FlowManager>, holder: &FlowExecutionHolder) {
    if let Err(e) = flow_manager.save_executable_flow(holder) {
        log::error!(
            "failed to persist execution [{}]: {e}",
            holder.flow.id()
        );
    }
}

struct ExecutionWatch {
    inner: Arc<ExecutorInner>,
    holder: Arc<FlowExecutionHolder>,
    name: String,
    on_complete: Option<Box<dyn Fn(Status) + Send + Sync>>,
}

impl FlowCallback for ExecutionWatch {
    fn progress_made(&self) {
        save_quietly(&self.inner.flow_manager, &self.holder);
    }

    fn completed(&self, status: Status) {
        save_quietly(&self.inner.flow_manager, &self.holder);

        let record = self.inner.executing.remove(&self.name).map(|(_, e)| e.record);
        let mut record = record.unwrap_or_else(|| ExecutionRecord {
            id: self.holder.flow.id().to_string(),
            name: self.name.clone(),
            started: self.holder.flow.start_time().unwrap_or_else(Utc::now),
            ended: None,
            status,
        });
        record.ended = Some(Utc::now());
        record.status = status;

        match status {
            Status::Succeeded | Status::Completed => {
                self.send_success_email(&record);
            }
            _ => {
                self.send_failure_email();
            }
        }

        self.inner.completed.lock().unwrap().push(record);

        if let Some(hook) = &self.on_complete {
            hook(status);
        }
    }
}

impl ExecutionWatch {
    fn recipients_and_sender(&self) -> (Vec<String>, Option<String>) {
        let descriptor = self
            .inner
            .job_manager
            .descriptor(&self.name)
            .ok()
            .flatten();
        let recipients = descriptor
            .as_ref()
            .map(|d| d.email_list().to_vec())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| self.inner.default_recipients.clone());
        let sender = descriptor
            .as_ref()
            .and_then(|d| d.sender().map(str::to_string))
            .or_else(|| self.inner.default_sender.clone());
        (recipients, sender)
    }

    fn send_success_email(&self, record: &ExecutionRecord) {
        let (recipients, sender) = self.recipients_and_sender();
        let duration = record
            .ended
            .map(|end| end - record.started)
            .map(|d| format!("{}s", d.num_seconds()))
            .unwrap_or_else(|| "unknown".to_string());
        let subject = format!("Flow [{}] completed successfully on {}", self.name, hostname());
        let body = format!(
            "Flow [{}] (execution {}) completed successfully in {duration}.",
            self.name,
            self.holder.flow.id()
        );
        send_email_if_possible(&*self.inner.mailman, sender.as_deref(), &recipients, &subject, &body);
    }

    /// One section per failed sub-flow: the error chain plus the tail of
    /// that job's most recent log file.
    fn send_failure_email(&self) {
        let (recipients, sender) = self.recipients_and_sender();
        let subject = format!("Flow [{}] has failed on {}", self.name, hostname());

        let mut body = format!(
            "Flow [{}] (execution {}) failed.\n",
            self.name,
            self.holder.flow.id()
        );
        let mut failures: Vec<(String, Arc<anyhow::Error>)> =
            self.holder.flow.exceptions().into_iter().collect();
        failures.sort_by(|a, b| a.0.cmp(&b.0));

        for (job, error) in failures {
            body.push_str(&format!("\n--- Job [{job}] ---\n{error:?}\n"));
            if let Some(log_path) = self.inner.job_manager.most_recent_log(&job) {
                body.push_str(&format!("\nLog file: {}\n", log_path.display()));
                match tail_file(&log_path, LOG_TAIL_LINES) {
                    Ok(lines) => {
                        body.push_str(&format!("Last {} log lines:\n", lines.len()));
                        for line in lines {
                            body.push_str(&line);
                            body.push('\n');
                        }
                    }
                    Err(e) => {
                        body.push_str(&format!("(could not read log file: {e})\n"));
                    }
                }
            }
        }

        send_email_if_possible(&*self.inner.mailman, sender.as_deref(), &recipients, &subject, &body);
    }
}

fn hostname() -> String {
    // Resolution failures must never be fatal to notification.
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
