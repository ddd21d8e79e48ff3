pub mod task;
pub mod registry;
pub mod graph;
pub mod store;
pub mod runner;
pub mod fanout;
pub mod executor;

pub use task::{BlockingTask, ExecutionPolicy, MapSource, MapSpec, NonBlockingTask, Task};
pub use registry::{Registry, Template};
pub use graph::Plan;
pub use store::ResultStore;
pub use executor::Wove;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Value produced by a task and passed to its dependents.
pub type TaskValue = serde_json::Value;
/// Resolved dependency values, keyed by dependency name.
pub type TaskArgs = HashMap<String, TaskValue>;
pub type BoxTask = Arc<dyn Task>;

#[derive(Error, Debug)]
pub enum WoveError {
    #[error("Circular dependency detected")]
    CircularDependency,
    #[error("Name {0:?} is reserved by the result store")]
    ReservedName(String),
    #[error("Seed value {0:?} collides with a registered task")]
    SeedCollision(String),
    #[error("Task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },
    #[error("Task {task:?} maps over unknown task {source_task:?}")]
    UnknownMapSource { task: String, source_task: String },
    #[error("Task {task:?}: item parameter {param:?} shadows a task or seed name")]
    ItemParamShadowed { task: String, param: String },
    #[error("Task {task:?}: {reason}")]
    InvalidPolicy { task: String, reason: String },
    #[error("Task {task:?}: map source produced {found}, expected a list")]
    MapSourceNotIterable { task: String, found: String },
    #[error("Task {task:?} timed out after {timeout:?}")]
    AttemptTimeout { task: String, timeout: Duration },
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
    #[error("Context cancelled: {0}")]
    ContextCancelled(String),
}
