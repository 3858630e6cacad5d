//! Error types for pipeline runs.
use thiserror::Error;

/// Broad classes of failure a run can end with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Required options are absent for the supplied operation list.
    Configuration,
    /// An operation names a command that does not exist.
    UnknownCommand,
    /// A command's own precondition failed before any I/O started.
    Precondition,
    /// The underlying primitive failed while running.
    Execution,
}

/// Errors produced while validating or executing a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Missing options: {}", .0.join(", "))]
    MissingOptions(Vec<String>),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Missing {0} option")]
    MissingOption(String),

    #[error("Invalid {name} option: expected {expected}")]
    InvalidOption { name: String, expected: String },

    #[error("Process exited with code {0}")]
    ExitCode(i32),

    #[error("Process terminated by signal")]
    Terminated,

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Execution(anyhow::Error),
}

impl From<anyhow::Error> for PipelineError {
    /// Recovers a `PipelineError` that travelled through `anyhow`, so that
    /// e.g. a cancellation inside a primitive is still reported as one.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(err) => err,
            Err(err) => PipelineError::Execution(err),
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::MissingOptions(_) => ErrorKind::Configuration,
            PipelineError::UnknownCommand(_) => ErrorKind::UnknownCommand,
            PipelineError::MissingOption(_) | PipelineError::InvalidOption { .. } => {
                ErrorKind::Precondition
            }
            PipelineError::ExitCode(_)
            | PipelineError::Terminated
            | PipelineError::Cancelled
            | PipelineError::Io(_)
            | PipelineError::Execution(_) => ErrorKind::Execution,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
