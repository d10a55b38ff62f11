use thiserror::Error;

use crate::Task;

/// Raised when a template reads a context variable the context doesn't have.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Template '{template}' uses context variable '{variable}', which is missing from the context")]
    MissingVariable { template: String, variable: String },
}

/// Raised while expanding templates into a [`ResolvedGraph`](crate::ResolvedGraph).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Cycle detected in task graph at '{task}'")]
    Cycle { task: String },

    #[error("Task '{task}' exceeds the maximum resolution depth of {limit}")]
    DepthExceeded { task: String, limit: usize },

    #[error("Resolution produced more than {limit} distinct tasks")]
    TooManyTasks { limit: usize },
}

/// A payload invocation failed and the remainder of the dispatch was halted.
///
/// Everything listed in `committed` has run and stays committed, dispatching
/// the same roots again on the same dispatcher only runs the remainder.
#[derive(Debug, Error)]
#[error("Task '{task}' failed ({} committed, {} not attempted):\n{error}", .committed.len(), .not_attempted.len())]
pub struct PayloadError {
    /// The task whose payload failed. For a sequence batch this is the first
    /// task of the batch.
    pub task: Task,
    /// Every task handed to the failing invocation.
    pub batch: Vec<Task>,
    /// Tasks which ran to completion before the failure.
    pub committed: Vec<Task>,
    /// Tasks which were never started.
    pub not_attempted: Vec<Task>,
    /// The error returned (or panic raised) by the payload.
    pub error: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Error while resolving the task graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Error while computing task identity:\n{0}")]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Payload(#[from] Box<PayloadError>),
}

impl From<PayloadError> for DispatchError {
    fn from(err: PayloadError) -> Self {
        DispatchError::Payload(Box::new(err))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameListError {
    #[error("Empty frame list")]
    Empty,

    #[error("Couldn't parse frame '{0}'")]
    Frame(String),

    #[error("Invalid step in '{0}', the step must be a positive integer")]
    Step(String),

    #[error("Frame list holds more than {limit} frames")]
    TooLong { limit: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse dispatch config.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid dispatch config: {0}")]
    Invalid(String),
}

#[cfg(feature = "logging")]
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error(transparent)]
    Filter(#[from] tracing_subscriber::filter::ParseError),
}
