//! Per-node task execution: worker thread ring and spill-capable queues.

pub mod manager;
pub mod queue;
pub mod worker;

pub use manager::WorkerManager;
pub use queue::CachedReceiverQueue;

use std::fmt::Debug;
use std::sync::Arc;

use tessera_error::Result;

use crate::ident::TaskId;

/// A schedulable unit owned by one worker thread.
///
/// `enqueue_message` may be called from any thread (network receiver or a
/// local producer); everything else is called only by the owning worker
/// thread after the task has been handed to it.
pub trait WorkerTask: Debug + Send + Sync {
    fn id(&self) -> TaskId;

    fn coordinator_id(&self) -> TaskId;

    /// Static cost estimate used for initial placement.
    fn estimated_load(&self) -> u64;

    /// Measured load used for rebalancing.
    fn current_load(&self) -> u64;

    /// Allow the worker loop to begin calling `execute`.
    fn start(&self);

    fn is_started(&self) -> bool;

    /// Inbound message addressed to this task instance.
    fn enqueue_message(&self, data: &[u8]) -> Result<()>;

    /// One non-blocking, incremental step of work.
    fn execute(&self) -> Result<()>;

    /// Whether any input queue holds data (or, for source tasks, whether the
    /// source is unexhausted).
    fn has_input(&self) -> bool;

    /// Whether `execute` must run even without input, e.g. to perform setup
    /// or completion bookkeeping.
    fn has_to_perform_final_steps(&self) -> bool;

    fn is_in_final_state(&self) -> bool;

    /// Cooperative cancellation; transitions a non-final task to aborted and
    /// releases its resources.
    fn close(&self);

    /// Direct child task instances on this node.
    fn children(&self) -> Vec<Arc<dyn WorkerTask>>;
}
