#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod config;
mod context;
mod core;
mod engine;
mod error;
mod frames;
mod task;
mod template;
mod utils;

pub use crate::blueprint::{Blueprint, TemplateDef};
pub use crate::config::{DispatchConfig, ResolveLimits};
pub use crate::context::{ExecutionContext, FRAME, FRAMES_PER_SECOND, Value};
pub use crate::core::Hash32;
pub use crate::engine::{
    BatchExecution, CancelToken, DispatchStatus, Dispatcher, ExecutionReport, ResolvedGraph,
    TaskGraphResolver,
};
pub use crate::error::*;
pub use crate::frames::{FrameList, MAX_FRAMES};
pub use crate::task::Task;
pub use crate::template::{TaskGraph, TaskTemplate, TemplateId};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
