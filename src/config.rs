use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::telemetry::Telemetry;

/// Settings for a [`Submitter`](crate::Submitter).
///
/// ```rust
/// use kumiki::RunConfig;
///
/// let config = RunConfig::default()
///     .jobs(4)
///     .cache_dir("/tmp/kumiki-cache")
///     .label("experiment-1");
/// assert_eq!(config.get_jobs(), 4);
/// ```
#[derive(Clone)]
pub struct RunConfig {
    pub(crate) jobs: usize,
    pub(crate) cache_dir: Option<Utf8PathBuf>,
    pub(crate) label: String,
    pub(crate) output_dir: Option<Utf8PathBuf>,
    pub(crate) telemetry: Option<Arc<dyn Telemetry>>,
    pub(crate) progress: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            cache_dir: None,
            label: String::from("default"),
            output_dir: None,
            telemetry: None,
            progress: true,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of task bodies running at once. Zero is treated as one.
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Directory backing the [`CacheStore`](crate::CacheStore). Without one,
    /// every body runs on every run.
    pub fn cache_dir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.cache_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Label of the run (an experiment name), passed to telemetry.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Directory the tasks write their products to, passed to telemetry.
    pub fn output_dir(mut self, dir: impl AsRef<Utf8Path>) -> Self {
        self.output_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Receives one record per task body invocation.
    pub fn telemetry(mut self, sink: impl Telemetry + 'static) -> Self {
        self.telemetry = Some(Arc::new(sink));
        self
    }

    /// Toggles the run banner and progress bars.
    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn get_jobs(&self) -> usize {
        self.jobs
    }

    pub fn get_cache_dir(&self) -> Option<&Utf8Path> {
        self.cache_dir.as_deref()
    }

    pub fn get_label(&self) -> &str {
        &self.label
    }

    pub fn get_output_dir(&self) -> Option<&Utf8Path> {
        self.output_dir.as_deref()
    }
}

impl Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("jobs", &self.jobs)
            .field("cache_dir", &self.cache_dir)
            .field("label", &self.label)
            .field("output_dir", &self.output_dir)
            .field("telemetry", &self.telemetry.is_some())
            .field("progress", &self.progress)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert!(config.get_jobs() >= 1);
        assert_eq!(config.get_label(), "default");
        assert!(config.get_cache_dir().is_none());
    }

    #[test]
    fn test_zero_jobs_clamped() {
        assert_eq!(RunConfig::new().jobs(0).get_jobs(), 1);
    }
}
