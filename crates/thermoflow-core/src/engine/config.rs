use super::progress::ProgressReporter;
use super::shared_error::ErrorChannel;
use crate::core::models::action::Action;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Memory budget must be positive when set")]
    ZeroBudget,
    #[error("Executor needs at least one worker thread")]
    ZeroThreads,
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),
    #[error("An action override requires cache_complexes = false")]
    ActionWithSharedCache,
}

/// Handle to the worker pool that runs a submission's task graph.
#[derive(Clone)]
pub struct Executor {
    pool: Arc<ThreadPool>,
    threads: usize,
}

static DEFAULT_EXECUTOR: OnceLock<Result<Executor, ConfigError>> = OnceLock::new();

impl Executor {
    pub fn new(threads: usize) -> Result<Self, ConfigError> {
        if threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("thermoflow-worker-{i}"))
            .build()
            .map_err(|e| ConfigError::ThreadPool(e.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
            threads,
        })
    }

    /// The shared single-worker pool used when no executor is configured.
    pub fn single_worker() -> Result<Self, ConfigError> {
        DEFAULT_EXECUTOR.get_or_init(|| Executor::new(1)).clone()
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub(crate) fn spawn<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(work);
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("threads", &self.threads)
            .finish()
    }
}

/// Per-submission knobs.
#[derive(Debug, Clone)]
pub struct ComputeOptions {
    /// Memory budget in bytes; `None` disables eviction.
    pub max_bytes: Option<usize>,
    /// Worker pool; `None` uses the shared single-worker pool.
    pub executor: Option<Executor>,
    /// When false, block tables live only for the submission. Strand tables
    /// are always shared.
    pub cache_complexes: bool,
    pub action: Option<Action>,
    /// Share one first-error store across submissions; a fresh one is used
    /// per submission otherwise.
    pub error_channel: Option<ErrorChannel>,
    pub reporter: ProgressReporter,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        Self {
            max_bytes: None,
            executor: None,
            cache_complexes: true,
            action: None,
            error_channel: None,
            reporter: ProgressReporter::new(),
        }
    }
}

impl ComputeOptions {
    pub fn builder() -> ComputeOptionsBuilder {
        ComputeOptionsBuilder::new()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bytes == Some(0) {
            return Err(ConfigError::ZeroBudget);
        }
        if self.action.is_some() && self.cache_complexes {
            return Err(ConfigError::ActionWithSharedCache);
        }
        Ok(())
    }

    pub(crate) fn resolve_executor(&self) -> Result<Executor, ConfigError> {
        match &self.executor {
            Some(executor) => Ok(executor.clone()),
            None => Executor::single_worker(),
        }
    }
}

#[derive(Default)]
pub struct ComputeOptionsBuilder {
    max_bytes: Option<usize>,
    threads: Option<usize>,
    executor: Option<Executor>,
    cache_complexes: Option<bool>,
    action: Option<Action>,
    error_channel: Option<ErrorChannel>,
    reporter: Option<ProgressReporter>,
}

impl ComputeOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = Some(bytes);
        self
    }
    /// Builds a dedicated pool with this many workers, unless an executor is
    /// also given.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }
    pub fn executor(mut self, executor: Executor) -> Self {
        self.executor = Some(executor);
        self
    }
    pub fn cache_complexes(mut self, enabled: bool) -> Self {
        self.cache_complexes = Some(enabled);
        self
    }
    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }
    pub fn error_channel(mut self, channel: ErrorChannel) -> Self {
        self.error_channel = Some(channel);
        self
    }
    pub fn reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn build(self) -> Result<ComputeOptions, ConfigError> {
        let executor = match (self.executor, self.threads) {
            (Some(executor), _) => Some(executor),
            (None, Some(threads)) => Some(Executor::new(threads)?),
            (None, None) => None,
        };
        let options = ComputeOptions {
            max_bytes: self.max_bytes,
            executor,
            cache_complexes: self.cache_complexes.unwrap_or(true),
            action: self.action,
            error_channel: self.error_channel,
            reporter: self.reporter.unwrap_or_default(),
        };
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::action::ActionKind;

    fn bonus() -> Action {
        Action::new("bonus", |_, _, _| (-1.0, ActionKind::Bonus))
    }

    #[test]
    fn defaults_share_the_complex_cache_without_budget() {
        let options = ComputeOptions::builder().build().unwrap();
        assert!(options.cache_complexes);
        assert_eq!(options.max_bytes, None);
        assert!(options.executor.is_none());
        assert_eq!(options.resolve_executor().unwrap().threads(), 1);
    }

    #[test]
    fn builder_creates_a_dedicated_pool() {
        let options = ComputeOptions::builder()
            .threads(3)
            .max_bytes(1 << 20)
            .build()
            .unwrap();
        assert_eq!(options.executor.unwrap().threads(), 3);
        assert_eq!(options.max_bytes, Some(1 << 20));
    }

    #[test]
    fn contradictory_values_are_rejected() {
        assert_eq!(
            ComputeOptions::builder().max_bytes(0).build().unwrap_err(),
            ConfigError::ZeroBudget
        );
        assert_eq!(
            ComputeOptions::builder().threads(0).build().unwrap_err(),
            ConfigError::ZeroThreads
        );
        assert_eq!(
            ComputeOptions::builder().action(bonus()).build().unwrap_err(),
            ConfigError::ActionWithSharedCache
        );
        assert!(
            ComputeOptions::builder()
                .action(bonus())
                .cache_complexes(false)
                .build()
                .is_ok()
        );
    }
}
