//! Application configuration.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::jobs::descriptor::JobDescriptor;

fn default_store_dir() -> PathBuf {
    PathBuf::from("executions")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_schedule_file() -> PathBuf {
    PathBuf::from("jobflow.schedule")
}

fn default_max_threads() -> usize {
    8
}

fn default_cache_capacity() -> usize {
    32
}

/// Top-level configuration, read from a JSON file by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Directory holding persisted execution snapshots.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Directory job log files are written to.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Path of the schedule table. Its backup lives next to it.
    #[serde(default = "default_schedule_file")]
    pub schedule_file: PathBuf,

    /// Named permit pools and their sizes.
    #[serde(default)]
    pub permit_pools: HashMap<String, u32>,

    /// Sender address used when a job declares none.
    #[serde(default)]
    pub default_sender: Option<String>,

    /// Recipients used when a job declares none.
    #[serde(default)]
    pub default_recipients: Vec<String>,

    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Bound on the execution cache of the caching flow manager.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Job descriptors this instance serves.
    #[serde(default)]
    pub jobs: Vec<JobDescriptor>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            log_dir: default_log_dir(),
            schedule_file: default_schedule_file(),
            permit_pools: HashMap::new(),
            default_sender: None,
            default_recipients: Vec::new(),
            max_threads: default_max_threads(),
            cache_capacity: default_cache_capacity(),
            jobs: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let config: AppConfig = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {path:?}"))?;
        Ok(config)
    }
}
