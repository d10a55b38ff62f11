mod dispatcher;
mod resolver;
mod runner;

pub use crate::engine::dispatcher::{CancelToken, Dispatcher};
pub use crate::engine::resolver::{ResolvedGraph, TaskGraphResolver};
pub use crate::engine::runner::{BatchExecution, DispatchStatus, ExecutionReport};
