use std::fmt::{Display, Formatter};
use std::sync::Arc;

use thiserror::Error;

use crate::engine::Outcome;

/// Top-level error for everything that can go wrong outside of a single task.
#[derive(Debug, Error)]
pub enum KumikiError {
    #[error("Invalid workflow graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Workflow run failed:\n{0}")]
    Run(#[from] RunError),

    #[error("Cache store error:\n{0}")]
    Cache(#[from] CacheError),

    #[error("Input discovery failed:\n{0}")]
    Discover(#[from] DiscoverError),

    #[error("Failed to build the worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Errors raised while authoring a workflow. They are local to the call that
/// raised them; the graph is left unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("A node named '{0}' already exists")]
    DuplicateName(String),

    #[error("Node '{node}' references '{producer}', which is not in the graph")]
    DanglingReference { node: String, producer: String },

    #[error("Node '{producer}' has no output named '{output}'")]
    UnknownOutput { producer: String, output: String },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Node '{0}' does not exist")]
    UnknownNode(String),

    #[error("No split is open on axis '{0}'")]
    NoActiveSplit(String),

    #[error("Axis '{0}' is already split")]
    AxisAlreadyOpen(String),

    #[error("Axis '{axis}' cannot be combined while axis '{inner}' is still open")]
    AxisNotInnermost { axis: String, inner: String },

    #[error("Workflow output '{0}' is declared twice")]
    DuplicateOutput(String),
}

/// A resolved input did not have the shape the task body expected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid input '{input}': {reason}")]
pub struct InvalidInput {
    pub input: String,
    pub reason: String,
}

impl InvalidInput {
    pub fn new(input: impl Into<String>, reason: impl Display) -> Self {
        Self {
            input: input.into(),
            reason: reason.to_string(),
        }
    }
}

/// The failure of a single node instance.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidInput),

    #[error("Declared output '{0}' was not produced")]
    MissingOutput(String),

    #[error("{0:#}")]
    Body(anyhow::Error),

    #[error("Task panicked: {0}")]
    Panic(String),

    #[error("Dependency '{dependency}' failed (root cause in '{root}': {cause})")]
    DependencyFailed {
        /// The direct dependency whose failure was propagated.
        dependency: String,
        /// The instance where the failure originated.
        root: String,
        /// The error of the root instance.
        cause: Arc<TaskError>,
    },
}

impl TaskError {
    /// Classifies an error returned by a task body, keeping
    /// [`InvalidInput`] distinct from other failures.
    pub(crate) fn from_body(error: anyhow::Error) -> Self {
        match error.downcast::<InvalidInput>() {
            Ok(invalid) => TaskError::InvalidInput(invalid),
            Err(error) => TaskError::Body(error),
        }
    }
}

/// An instance whose own body (or input resolution) failed.
#[derive(Debug, Clone)]
pub struct RootCause {
    pub instance: String,
    pub error: Arc<TaskError>,
}

impl Display for RootCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}': {}", self.instance, self.error)
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    /// At least one requested output could not be produced. The partial
    /// outcome still holds every output that did succeed.
    #[error(
        "{} requested output(s) failed:\n{}",
        .failed.len(),
        .causes.iter().map(|c| format!("  - {c}")).collect::<Vec<_>>().join("\n")
    )]
    TasksFailed {
        failed: Vec<String>,
        causes: Vec<RootCause>,
        outcome: Box<Outcome>,
    },

    #[error("Scheduler stalled with {0} instance(s) never becoming ready")]
    Stalled(usize),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Couldn't encode cache record: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_error_keeps_invalid_input_kind() {
        let err = anyhow::Error::new(InvalidInput::new("x", "expected a number"));
        assert!(matches!(
            TaskError::from_body(err),
            TaskError::InvalidInput(InvalidInput { ref input, .. }) if input == "x"
        ));

        let err = anyhow::anyhow!("boom");
        assert!(matches!(TaskError::from_body(err), TaskError::Body(_)));
    }

    #[test]
    fn test_cycle_message() {
        let err = GraphError::Cycle(vec!["a".into(), "a".into()]);
        assert_eq!(err.to_string(), "Dependency cycle: a -> a");
    }
}
