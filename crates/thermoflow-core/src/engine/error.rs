use super::config::ConfigError;
use crate::core::kernel::KernelError;
use crate::core::models::complex::ComplexError;
use crate::core::models::job::JobError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid complex: {0}")]
    Complex(#[from] ComplexError),

    #[error("Invalid job for complex '{complex}': {source}")]
    Job {
        complex: String,
        #[source]
        source: JobError,
    },

    #[error("Invalid compute options: {0}")]
    Config(#[from] ConfigError),

    #[error("Numeric failure for complex '{complex}': {reason}")]
    Numeric { complex: String, reason: String },

    #[error("Internal consistency check failed: {0}")]
    Consistency(String),

    #[error("Resource budget violated: {0}")]
    Resource(String),

    #[error("Kernel failed on complex '{complex}': {source}")]
    Kernel {
        complex: String,
        #[source]
        source: KernelError,
    },

    #[error("Work item '{task}' panicked: {message}")]
    Panicked { task: String, message: String },

    #[error("Result of this submission was already taken")]
    ResultAlreadyTaken,
}

impl EngineError {
    /// True for errors reported synchronously, before any work is scheduled.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Complex(_) | EngineError::Job { .. } | EngineError::Config(_)
        )
    }

    pub(crate) fn kernel(complex: impl ToString, source: KernelError) -> Self {
        EngineError::Kernel {
            complex: complex.to_string(),
            source,
        }
    }

    pub(crate) fn numeric(complex: impl ToString, reason: impl Into<String>) -> Self {
        EngineError::Numeric {
            complex: complex.to_string(),
            reason: reason.into(),
        }
    }
}
