//! Job descriptors: the declarative description of a job.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::props::Props;

/// Everything known about a job before it runs. Immutable once loaded;
/// re-resolving a name through the descriptor source picks up changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    name: String,
    /// Slash-separated logical location, e.g. `etl/daily/load.job`. The
    /// first segment is the folder the job is indexed under.
    #[serde(default)]
    path: String,
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    props: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    retries: u32,
    #[serde(default)]
    retry_backoff_ms: u64,
    /// Permits demanded from the shared throttling pool; zero means
    /// unthrottled.
    #[serde(default)]
    num_permits: u32,
    #[serde(default)]
    read_locks: Vec<String>,
    #[serde(default)]
    write_locks: Vec<String>,
    #[serde(default)]
    email_list: Vec<String>,
    #[serde(default)]
    sender: Option<String>,
}

pub const DEFAULT_FOLDER: &str = "default";

impl JobDescriptor {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: String::new(),
            job_type: job_type.into(),
            props: BTreeMap::new(),
            dependencies: Vec::new(),
            retries: 0,
            retry_backoff_ms: 0,
            num_permits: 0,
            read_locks: Vec::new(),
            write_locks: Vec::new(),
            email_list: Vec::new(),
            sender: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The folder index key: the first path segment, or `default` for a
    /// pathless descriptor.
    pub fn folder(&self) -> &str {
        match self.path.split('/').next() {
            Some(segment) if !segment.is_empty() => segment,
            _ => DEFAULT_FOLDER,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn props(&self) -> Props {
        Props::from_map(self.props.clone())
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_backoff_ms(&self) -> u64 {
        self.retry_backoff_ms
    }

    pub fn num_permits(&self) -> u32 {
        self.num_permits
    }

    pub fn read_locks(&self) -> &[String] {
        &self.read_locks
    }

    pub fn write_locks(&self) -> &[String] {
        &self.write_locks
    }

    pub fn email_list(&self) -> &[String] {
        &self.email_list
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    // Builder-style setters used by descriptor sources and tests.

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.retries = retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_permits(mut self, num_permits: u32) -> Self {
        self.num_permits = num_permits;
        self
    }

    pub fn with_read_locks(mut self, locks: Vec<String>) -> Self {
        self.read_locks = locks;
        self
    }

    pub fn with_write_locks(mut self, locks: Vec<String>) -> Self {
        self.write_locks = locks;
        self
    }

    pub fn with_email_list(mut self, emails: Vec<String>) -> Self {
        self.email_list = emails;
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_from_path() {
        let d = JobDescriptor::new("load", "noop").with_path("etl/daily/load.job");
        assert_eq!(d.folder(), "etl");

        let d = JobDescriptor::new("load", "noop");
        assert_eq!(d.folder(), DEFAULT_FOLDER);
    }

    #[test]
    fn test_deserializes_with_defaults() {
        let d: JobDescriptor =
            serde_json::from_str(r#"{"name": "a", "type": "command"}"#).unwrap();
        assert_eq!(d.name(), "a");
        assert_eq!(d.job_type(), "command");
        assert!(d.dependencies().is_empty());
        assert_eq!(d.retries(), 0);
    }
}
