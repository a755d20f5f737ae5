#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod cache;
mod config;
mod core;
pub mod discover;
mod engine;
mod error;
#[cfg(feature = "logging")]
mod logging;
mod telemetry;
mod utils;

pub use crate::blueprint::{Blueprint, NodeHandle, Workflow};
pub use crate::cache::{CacheStore, Fingerprint};
pub use crate::config::RunConfig;
pub use crate::core::Value;
pub use crate::engine::{
    Binding, Diagnostics, ExecutionResult, Inputs, LazyRef, NodeBuilder, Outcome, Outputs, Status,
    Stream, Submitter, TaskExecution, TaskNode, TaskResult,
};
pub use crate::error::*;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::telemetry::{BenchmarkLog, Invocation, Telemetry};
