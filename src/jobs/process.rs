//! Job type that runs an external command.

use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};

use crate::common::props::Props;
use crate::jobs::descriptor::JobDescriptor;
use crate::jobs::job::Job;
use crate::jobs::wrapping::JobTypeFactory;

pub const COMMAND_PROP: &str = "command";
pub const WORKING_DIR_PROP: &str = "working.dir";

/// Runs the shell command named by the `command` property and succeeds
/// when it exits zero. `cancel` kills the running child, if any.
pub struct ProcessJob {
    name: String,
    command: String,
    working_dir: Option<String>,
    child: Mutex<Option<Child>>,
}

impl ProcessJob {
    pub fn new(name: impl Into<String>, props: &Props) -> Result<Self, anyhow::Error> {
        let command = props
            .get(COMMAND_PROP)
            .ok_or_else(|| anyhow!("process job requires a [{COMMAND_PROP}] property"))?
            .to_string();
        Ok(Self {
            name: name.into(),
            command,
            working_dir: props.get(WORKING_DIR_PROP).map(str::to_string),
            child: Mutex::new(None),
        })
    }
}

impl Job for ProcessJob {
    fn id(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<(), anyhow::Error> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        log::info!("job [{}] running command: {}", self.name, self.command);
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn command for job [{}]", self.name))?;
        *self.child.lock().unwrap() = Some(child);

        // Poll rather than wait() so cancel() can take the lock and kill.
        let status = loop {
            let mut guard = self.child.lock().unwrap();
            let child = guard
                .as_mut()
                .ok_or_else(|| anyhow!("job [{}] was cancelled", self.name))?;
            match child
                .try_wait()
                .with_context(|| format!("failed waiting on command of job [{}]", self.name))?
            {
                Some(status) => break status,
                None => {
                    drop(guard);
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
            }
        };
        *self.child.lock().unwrap() = None;

        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("job [{}] command exited with {status}", self.name))
        }
    }

    fn cancel(&self) -> Result<(), anyhow::Error> {
        let mut guard = self.child.lock().unwrap();
        if let Some(child) = guard.as_mut() {
            child
                .kill()
                .with_context(|| format!("failed to kill command of job [{}]", self.name))?;
        }
        Ok(())
    }
}

/// Factory for the `command` job type.
pub struct ProcessJobFactory;

impl JobTypeFactory for ProcessJobFactory {
    fn create(
        &self,
        descriptor: &JobDescriptor,
        props: &Props,
    ) -> Result<Arc<dyn Job>, anyhow::Error> {
        Ok(Arc::new(ProcessJob::new(descriptor.name(), props)?))
    }
}
