//! Query execution: task lifecycle, operators, tree wire format, and the
//! coordinator.

pub mod coordinator;
pub mod operators;
pub mod task;
pub mod tree;

pub use coordinator::QueryCoordinator;
pub use task::{ParentInfo, QueryOperator, TaskBase, TaskParams, TaskState};
pub use tree::{JoinKind, OperatorDef, OperatorKind};
