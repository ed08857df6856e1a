//! Configuration for Tidepool writers
//!
//! Presets for common workloads plus validation. The batching policy
//! (threshold and the two timer periods) lives here rather than in the
//! writer so deployments can tune it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{WriterError, WriterResult};

/// Default store file extension
pub const DEFAULT_EXTENSION: &str = "tide";

/// Writer configuration with workload presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding every store file
    pub root: PathBuf,
    /// Store file extension, without the dot
    pub extension: String,
    /// Pending operations that force a commit
    pub flush_threshold: usize,
    /// Capacity of each writer's inbox; a full inbox blocks submitters
    pub queue_capacity: usize,
    /// Longest time a pending operation waits before a timed commit
    pub flush_interval: Duration,
    /// Period of the idle check that retires quiet writers
    pub idle_interval: Duration,
}

impl Config {
    /// General purpose defaults rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            flush_threshold: 1000,
            queue_capacity: 1000,
            flush_interval: Duration::from_secs(5),
            idle_interval: Duration::from_secs(30 * 60),
        }
    }

    /// Large imports: big batches, long-lived writers.
    pub fn bulk_load(root: impl Into<PathBuf>) -> Self {
        Self {
            flush_threshold: 10_000,
            queue_capacity: 10_000,
            flush_interval: Duration::from_secs(10),
            idle_interval: Duration::from_secs(5 * 60),
            ..Self::new(root)
        }
    }

    /// Low write volume where staleness matters more than throughput.
    pub fn interactive(root: impl Into<PathBuf>) -> Self {
        Self {
            flush_threshold: 100,
            queue_capacity: 256,
            flush_interval: Duration::from_millis(250),
            idle_interval: Duration::from_secs(10 * 60),
            ..Self::new(root)
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> WriterResult<()> {
        if self.root.as_os_str().is_empty() {
            return Err(WriterError::Config("root must not be empty".into()));
        }
        if self.extension.is_empty()
            || self.extension.contains(['.', '/', '\\'])
        {
            return Err(WriterError::Config(
                "extension must be non-empty and contain no dots or separators".into(),
            ));
        }
        if self.flush_threshold == 0 {
            return Err(WriterError::Config("flush_threshold must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(WriterError::Config("queue_capacity must be > 0".into()));
        }
        if self.flush_interval.is_zero() {
            return Err(WriterError::Config("flush_interval must be > 0".into()));
        }
        if self.idle_interval < self.flush_interval {
            return Err(WriterError::Config("idle_interval must be >= flush_interval".into()));
        }
        Ok(())
    }
}
