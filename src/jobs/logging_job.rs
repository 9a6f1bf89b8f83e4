//! Per-run log file decorator.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::common::props::Props;
use crate::jobs::job::Job;

const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d.%H.%M.%S.%3f";

/// Writes one `{name}.{timestamp}.log` file per run with start and outcome
/// lines. The file feeds the failure-email log tail; problems writing it
/// are logged and never fail the job itself.
pub struct LoggingJob {
    inner: Arc<dyn Job>,
    log_dir: PathBuf,
}

impl LoggingJob {
    pub fn new(inner: Arc<dyn Job>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            log_dir: log_dir.into(),
        }
    }

    fn open_log(&self) -> Option<std::fs::File> {
        if let Err(e) = fs::create_dir_all(&self.log_dir) {
            log::warn!("could not create log dir {:?}: {e}", self.log_dir);
            return None;
        }
        let stamp = Utc::now().format(LOG_TIMESTAMP_FORMAT);
        let path = self.log_dir.join(format!("{}.{stamp}.log", self.inner.id()));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!("could not open job log {path:?}: {e}");
                None
            }
        }
    }
}

fn log_line(file: &mut Option<std::fs::File>, line: &str) {
    if let Some(f) = file {
        let stamped = format!("{} {line}\n", Utc::now().to_rfc3339());
        if let Err(e) = f.write_all(stamped.as_bytes()) {
            log::warn!("failed writing job log line: {e}");
        }
    }
}

impl Job for LoggingJob {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn run(&self) -> Result<(), anyhow::Error> {
        let mut file = self.open_log();
        log_line(&mut file, &format!("Job [{}] started", self.id()));
        let start = Utc::now();

        let result = self.inner.run();

        let elapsed = Utc::now() - start;
        match &result {
            Ok(()) => log_line(
                &mut file,
                &format!("Job [{}] succeeded in {}ms", self.id(), elapsed.num_milliseconds()),
            ),
            Err(e) => log_line(
                &mut file,
                &format!(
                    "Job [{}] failed after {}ms: {e:#}",
                    self.id(),
                    elapsed.num_milliseconds()
                ),
            ),
        }
        result
    }

    fn cancel(&self) -> Result<(), anyhow::Error> {
        self.inner.cancel()
    }

    fn progress(&self) -> Result<f64, anyhow::Error> {
        self.inner.progress()
    }

    fn generated_properties(&self) -> Props {
        self.inner.generated_properties()
    }
}

/// The most recently written `{name}.*.log` file for a job, if any. The
/// timestamp format sorts lexicographically, so the max file name wins.
pub fn most_recent_log(log_dir: &Path, name: &str) -> Option<PathBuf> {
    let prefix = format!("{name}.");
    let entries = fs::read_dir(log_dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|f| f.starts_with(&prefix) && f.ends_with(".log"))
        .max()
        .map(|f| log_dir.join(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopJob;

    impl Job for NoopJob {
        fn id(&self) -> &str {
            "noop"
        }

        fn run(&self) -> Result<(), anyhow::Error> {
            Ok(())
        }
    }

    #[test]
    fn test_writes_log_file_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let job = LoggingJob::new(Arc::new(NoopJob), dir.path());
        job.run().unwrap();

        let latest = most_recent_log(dir.path(), "noop").unwrap();
        let contents = fs::read_to_string(latest).unwrap();
        assert!(contents.contains("Job [noop] started"));
        assert!(contents.contains("Job [noop] succeeded"));
    }

    #[test]
    fn test_most_recent_log_picks_newest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.2024-01-01.00.00.00.000.log"), "old").unwrap();
        fs::write(dir.path().join("a.2024-06-01.00.00.00.000.log"), "new").unwrap();
        fs::write(dir.path().join("b.2024-12-01.00.00.00.000.log"), "other").unwrap();

        let latest = most_recent_log(dir.path(), "a").unwrap();
        assert!(latest
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("2024-06-01"));
    }
}
