//! Operation and task orchestration for the issue mirror.
//!
//! An operation (bootstrap, reconcile, forced sync, cleanup) is a small
//! dependency graph of tasks. [`processor::OperationProcessor`] builds the
//! graph, runs it in the background, and tracks per-operation and per-task
//! state for concurrent readers.

pub mod events;
pub mod graph;
pub mod operation;
pub mod processor;
pub mod tasks;

pub use events::{OperationEvent, OperationEventBus};
pub use graph::{GraphError, TaskGraph};
pub use operation::{
    Operation, OperationConfig, OperationKind, OperationResultSummary, OperationStatus, Task,
    TaskCounters, TaskOutput, TaskSpec, TaskStatus,
};
pub use processor::{OperationError, OperationProcessor, ProcessorConfig};
pub use tasks::{SyncTaskExecutor, TaskContext, TaskError, TaskExecutor};
