//! The task model and the machinery that runs it.
//!
//! ## Core abstractions
//!
//! * [`TaskNode`]: an immutable unit of work. Named inputs are bound to a
//!   [`Binding`], named outputs are declared up front, and the body is an
//!   opaque function from [`Inputs`] to [`Outputs`].
//! * [`LazyRef`]: a token representing the *future* output of another node.
//!   Binding one is the only way to create a dependency edge.
//! * [`Stream`]: the per-instance value of a split axis.
//!
//! ## Instances
//!
//! The graph is authored un-split. When a workflow runs, every node is
//! expanded into one instance per combination of the axes that were open when
//! it was added, and each instance moves through
//! `Pending → Ready → Running → Done | Failed` on its own.

mod binding;
mod node;
mod plan;
mod runner;

pub(crate) use crate::engine::binding::AxisId;
pub use crate::engine::binding::{Binding, LazyRef, Stream};
pub use crate::engine::node::{Inputs, NodeBuilder, Outputs, TaskNode, TaskResult};
pub use crate::engine::runner::{
    Diagnostics, ExecutionResult, Outcome, Status, Submitter, TaskExecution,
};
