//! Command-line runner: execute one job flow to completion.
//!
//! # Usage
//!
//! ```bash
//! runner <config.json> <job-name> [--ignore-deps]
//! ```
//!
//! Loads the configuration, builds the managers, starts the named flow,
//! waits for it to finish, and exits non-zero unless it succeeded.
//! `RUST_LOG` controls log verbosity (default: "info").

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;

use jobflow::common::mailer::LoggingMailman;
use jobflow::flow::{CachingFlowManager, FlowManager, RefreshableFlowManager};
use jobflow::jobs::locks::{NamedPermitManager, ReadWriteLockManager};
use jobflow::jobs::wrapping::{JobTypeFactory, JobWrappingFactory};
use jobflow::jobs::{InMemoryDescriptorSource, JobExecutorManager, JobManager, ProcessJobFactory};
use jobflow::{AppConfig, Status, WorkerPool};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("usage: runner <config.json> <job-name> [--ignore-deps]");
        return ExitCode::from(2);
    }
    let config_path = &args[1];
    let job_name = &args[2];
    let ignore_deps = args.iter().skip(3).any(|a| a == "--ignore-deps");

    match run(config_path, job_name, ignore_deps) {
        Ok(Status::Succeeded) => ExitCode::SUCCESS,
        Ok(status) => {
            log::error!("flow [{job_name}] finished with status {status}");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("runner failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &str, job_name: &str, ignore_deps: bool) -> Result<Status, anyhow::Error> {
    let config = AppConfig::from_file(config_path)?;
    std::fs::create_dir_all(&config.store_dir)?;
    std::fs::create_dir_all(&config.log_dir)?;

    let pool = Arc::new(WorkerPool::new(config.max_threads));

    let permit_manager = Arc::new(NamedPermitManager::new());
    for (name, total) in &config.permit_pools {
        permit_manager.add_permits(name.clone(), *total);
    }
    let lock_manager = Arc::new(ReadWriteLockManager::new());

    let mut type_factories: HashMap<String, Arc<dyn JobTypeFactory>> = HashMap::new();
    type_factories.insert("command".to_string(), Arc::new(ProcessJobFactory));
    let wrapping = Arc::new(JobWrappingFactory::new(
        type_factories,
        permit_manager,
        lock_manager,
        &config.log_dir,
    ));

    let source = Arc::new(InMemoryDescriptorSource::new(config.jobs.clone()));
    let job_manager = Arc::new(JobManager::new(
        Arc::clone(&source) as _,
        wrapping,
        &config.log_dir,
    ));

    let flow_manager = RefreshableFlowManager::new(
        source,
        Arc::clone(&job_manager) as _,
        Arc::clone(&pool),
        config.store_dir.clone(),
    )?;
    let flow_manager: Arc<dyn FlowManager> = Arc::new(CachingFlowManager::new(
        Arc::new(flow_manager),
        config.cache_capacity,
    ));

    let executor = JobExecutorManager::new(
        flow_manager,
        job_manager,
        Arc::new(LoggingMailman),
        config.default_sender.clone(),
        config.default_recipients.clone(),
    );

    let (tx, rx) = mpsc::channel();
    executor.execute_with_hook(
        job_name,
        ignore_deps,
        Some(Box::new(move |status: Status| {
            let _ = tx.send(status);
        })),
    )?;

    let status = rx.recv()?;
    log::info!("flow [{job_name}] finished with status {status}");
    Ok(status)
}
