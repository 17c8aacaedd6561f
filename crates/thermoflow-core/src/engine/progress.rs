use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Progress {
    PhaseStart { name: &'static str },
    PhaseFinish,

    TaskStart { total_steps: u64 },
    TaskIncrement,
    TaskFinish,

    Message(String),
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Cheaply clonable progress sink; work items on worker threads each hold
/// a clone.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_callback(callback: ProgressCallback) -> Self {
        Self {
            callback: Some(callback),
        }
    }

    #[inline]
    pub fn report(&self, event: Progress) {
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.callback.is_some()
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn clones_share_the_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::with_callback(Arc::new(move |p| {
            sink.lock().unwrap().push(format!("{p:?}"));
        }));
        let clone = reporter.clone();

        reporter.report(Progress::PhaseStart { name: "Scheduling" });
        clone.report(Progress::TaskIncrement);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("Scheduling"));
    }

    #[test]
    fn default_reporter_is_silent() {
        let reporter = ProgressReporter::new();
        assert!(!reporter.is_enabled());
        reporter.report(Progress::PhaseFinish);
    }
}
