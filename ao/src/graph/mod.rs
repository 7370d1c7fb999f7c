//! Task graph domain types
//!
//! A plan is a DAG of atomic tasks. [`Task`] carries the action,
//! parameters, dependencies and lifecycle status; [`TaskGraph`] owns the
//! tasks and both adjacency directions, and enforces acyclicity on every
//! insertion.

mod dag;
mod task;

pub use dag::{GraphError, TaskGraph};
pub use task::{Task, TaskMetadata, TaskPriority, TaskStatus};
