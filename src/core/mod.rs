//! Core domain models: tasks, execution records and the dependency graph.

pub mod analyzer;
pub mod dag;
pub mod record;
pub mod task;

pub use analyzer::{Analysis, ImplicitEdge, TaskAnalyzer};
pub use dag::{DependencyType, SchedulingLevel, TaskDAG};
pub use record::{ExecutionLog, ExecutionOutcome, ExecutionRecord, ResourceUsage};
pub use task::{ErrorClass, ErrorKind, Task, TaskFailure, TaskId, TaskSpec, TaskStatus};
