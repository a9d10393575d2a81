//! Task scheduling: serial lanes, queued tasks and lane assignment.

mod assign;
mod lane;
mod task;

pub use assign::QueueMode;

pub(crate) use assign::{LaneSet, OpKind};
pub(crate) use task::{Task, TaskContext, TaskOutcome};
