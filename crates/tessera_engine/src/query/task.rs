//! Shared task lifecycle.
//!
//! Every node of an execution tree, the coordinator included, runs the same
//! state machine:
//!
//! ```text
//! Created -> Started -> WaitingForOtherSlaves -> Finished
//!     \___________\_____________/
//!                 v
//!              Aborted
//! ```
//!
//! A task leaves `Started` once it is locally exhausted and all of its local
//! children are finished; it then broadcasts its completion to its sibling
//! instances on every other slave and waits in `WaitingForOtherSlaves` until
//! it has heard the same from all of them. The tree is instantiated
//! identically on every slave, so this peer-count barrier detects
//! distributed completion of one logical tree node without any central lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tessera_error::{Result, TesseraError};
use tracing::trace;

use crate::executor::queue::CachedReceiverQueue;
use crate::executor::WorkerTask;
use crate::ident::TaskId;
use crate::mapping::{Mapping, MappingPool};
use crate::message::codec::{self, TaskFinished};
use crate::message::sender::MappingSender;
use crate::message::types::MessageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Started,
    WaitingForOtherSlaves,
    Finished,
    Aborted,
}

/// What a child task needs to know about its parent to route emissions.
#[derive(Debug, Clone)]
pub struct ParentInfo {
    pub id: TaskId,
    /// The parent consumes everything locally (projections); no ownership
    /// routing applies.
    pub receives_locally: bool,
    /// The parent's lowest join variable; its value decides which slave owns
    /// a non-empty mapping.
    pub first_join_var: Option<u64>,
}

pub struct TaskParams {
    pub id: TaskId,
    pub coordinator: TaskId,
    pub sender: Arc<MappingSender>,
    pub children: Vec<Arc<dyn WorkerTask>>,
    pub estimated_load: u64,
    pub emitted_per_round: usize,
    pub input_queue_count: usize,
    pub queue_cache_size: usize,
    pub spill_directory: std::path::PathBuf,
}

/// State shared by every task implementation.
#[derive(Debug)]
pub struct TaskBase {
    id: TaskId,
    coordinator: TaskId,
    parent: OnceLock<ParentInfo>,
    state: Mutex<TaskState>,
    started: AtomicBool,
    input_queues: Vec<CachedReceiverQueue>,
    children: Vec<Arc<dyn WorkerTask>>,
    child_ids: Vec<TaskId>,
    /// Completion notifications still outstanding: one for this instance
    /// plus one per sibling.
    missing_finished: AtomicI64,
    sender: Arc<MappingSender>,
    estimated_load: u64,
    emitted_per_round: usize,
}

impl TaskBase {
    pub fn new(params: TaskParams) -> Result<Self> {
        let dir = params
            .spill_directory
            .join(format!("query_{}", params.id.query()))
            .join(format!("task_{}", params.id.task()));
        let input_queues = (0..params.input_queue_count)
            .map(|i| CachedReceiverQueue::new(params.queue_cache_size, dir.clone(), i))
            .collect::<Result<Vec<_>>>()?;
        let child_ids = params.children.iter().map(|c| c.id()).collect();
        let missing = if params.id.slave() == 0 {
            // The coordinator has no sibling instances; its barrier is the
            // per-slave root notifications it counts itself.
            0
        } else {
            params.sender.number_of_slaves() as i64
        };
        Ok(TaskBase {
            id: params.id,
            coordinator: params.coordinator,
            parent: OnceLock::new(),
            state: Mutex::new(TaskState::Created),
            started: AtomicBool::new(false),
            input_queues,
            children: params.children,
            child_ids,
            missing_finished: AtomicI64::new(missing),
            sender: params.sender,
            estimated_load: params.estimated_load,
            emitted_per_round: params.emitted_per_round,
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn coordinator(&self) -> TaskId {
        self.coordinator
    }

    pub fn sender(&self) -> &Arc<MappingSender> {
        &self.sender
    }

    pub fn pool(&self) -> &Arc<MappingPool> {
        self.sender.pool()
    }

    pub fn estimated_load(&self) -> u64 {
        self.estimated_load
    }

    pub fn emitted_per_round(&self) -> usize {
        self.emitted_per_round
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Advance the state only when it still matches `from`. `Aborted` is
    /// absorbing: an operator step or another thread may have closed the
    /// task, and that must never be overwritten.
    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        trace!(id = %self.id, ?to, "task state transition");
        *state = to;
        true
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Wire the parent routing info. Called once while the tree is built;
    /// tasks without a parent are tree roots.
    pub fn set_parent(&self, parent: ParentInfo) {
        let _ = self.parent.set(parent);
    }

    pub fn is_root(&self) -> bool {
        self.parent.get().is_none()
    }

    pub fn children(&self) -> &[Arc<dyn WorkerTask>] {
        &self.children
    }

    pub fn all_children_finished(&self) -> bool {
        self.children.iter().all(|c| c.is_in_final_state())
    }

    pub fn input_queue_is_empty(&self, index: usize) -> bool {
        self.input_queues
            .get(index)
            .map(|q| q.is_empty())
            .unwrap_or(true)
    }

    pub fn input_queue_len(&self, index: usize) -> u64 {
        self.input_queues.get(index).map(|q| q.len()).unwrap_or(0)
    }

    pub fn total_input_len(&self) -> u64 {
        self.input_queues.iter().map(|q| q.len()).sum()
    }

    pub fn has_queued_input(&self) -> bool {
        self.input_queues.iter().any(|q| !q.is_empty())
    }

    pub fn consume(&self, index: usize) -> Result<Option<Mapping>> {
        match self.input_queues.get(index) {
            Some(queue) => queue.dequeue(),
            None => Ok(None),
        }
    }

    fn queue_index_for(&self, sender: TaskId) -> Option<usize> {
        if self.children.is_empty() && self.input_queues.len() == 1 {
            // Single-queue consumers (the coordinator) take mappings from
            // any sender.
            return Some(0);
        }
        self.child_ids
            .iter()
            .position(|c| c.logical() == sender.logical())
    }

    /// Inbound message intake shared by every task kind. Unhandled tags are
    /// given to `handle_control`.
    pub fn enqueue_message(
        &self,
        data: &[u8],
        handle_control: impl FnOnce(&[u8]) -> Result<()>,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(TesseraError::new("empty message"));
        }
        match MessageType::from_tag(data[0])? {
            MessageType::QueryMappingBatch => {
                let sender = TaskId(crate::mapping::read_u64(data, crate::mapping::OFFSET_SENDER));
                let index = self.queue_index_for(sender).ok_or_else(|| {
                    TesseraError::new(format!("mapping from {sender} matches no child of {}", self.id))
                })?;
                self.input_queues[index].enqueue(data)
            }
            MessageType::QueryTaskFinished => match codec::decode_query_task_finished(data)? {
                TaskFinished::Sibling { .. } => {
                    self.missing_finished.fetch_sub(1, Ordering::AcqRel);
                    Ok(())
                }
                TaskFinished::Coordinator { .. } => handle_control(data),
            },
            _ => handle_control(data),
        }
    }

    /// Drive the state machine one step, delegating operator-specific work.
    pub fn execute_step(&self, operator: &dyn QueryOperator) -> Result<()> {
        match self.state() {
            TaskState::Created => {
                operator.execute_pre_start_step()?;
                self.transition(TaskState::Created, TaskState::Started);
                Ok(())
            }
            TaskState::Started => {
                operator.execute_operation_step()?;
                if self.all_children_finished() && operator.is_finished_locally() {
                    if !self.transition(TaskState::Started, TaskState::WaitingForOtherSlaves) {
                        return Ok(());
                    }
                    self.missing_finished.fetch_sub(1, Ordering::AcqRel);
                    operator.execute_final_step()?;
                    // A single-node tree has no peers to wait for.
                    self.try_finish(operator);
                }
                Ok(())
            }
            TaskState::WaitingForOtherSlaves => {
                self.try_finish(operator);
                Ok(())
            }
            TaskState::Finished | TaskState::Aborted => Ok(()),
        }
    }

    fn try_finish(&self, operator: &dyn QueryOperator) {
        if self.missing_finished.load(Ordering::Acquire) <= 0
            && self.transition(TaskState::WaitingForOtherSlaves, TaskState::Finished)
        {
            operator.tidy_up();
            for queue in &self.input_queues {
                queue.close();
            }
        }
    }

    pub fn is_in_final_state(&self) -> bool {
        matches!(self.state(), TaskState::Finished | TaskState::Aborted)
    }

    pub fn has_to_perform_final_steps(&self) -> bool {
        match self.state() {
            TaskState::Created | TaskState::WaitingForOtherSlaves => true,
            TaskState::Started => self.all_children_finished(),
            TaskState::Finished | TaskState::Aborted => false,
        }
    }

    pub fn close(&self, operator: &dyn QueryOperator) {
        {
            let mut state = self.state.lock();
            if *state != TaskState::Finished {
                *state = TaskState::Aborted;
            }
        }
        for queue in &self.input_queues {
            queue.close();
        }
        operator.close_internal();
    }

    /// Broadcast this instance's completion; called exactly once on the
    /// transition out of `Started`.
    pub fn send_task_finished(&self) -> Result<()> {
        self.sender
            .send_query_task_finished(self.id, self.is_root(), self.coordinator)
    }

    /// Hand a produced mapping to whoever consumes it.
    ///
    /// Routing rules, in order: a tree root sends to the coordinator; a
    /// locally-consuming parent gets the mapping on this slave; an empty
    /// mapping is broadcast to all parent instances by the first slave that
    /// knows it (marked as known everywhere); otherwise the slave owning the
    /// parent's first join variable value processes it, and the mapping
    /// travels there only if the owner does not already know it.
    pub fn emit_mapping(&self, mapping: Mapping, own_result_vars: &[u64]) -> Result<()> {
        let pool = self.pool();
        let local = self.sender.local_slave();
        let clen = pool.containment_len();
        let parent = match self.parent.get() {
            None => {
                return self
                    .sender
                    .send_query_mapping(mapping, self.id, self.coordinator);
            }
            Some(parent) => parent,
        };
        if parent.receives_locally {
            return self
                .sender
                .send_query_mapping(mapping, self.id, parent.id.on_slave(local));
        }
        if mapping.is_empty_mapping(clen) {
            match mapping.first_knowing_slave(clen) {
                Some(first) if first == local => {
                    let mut mapping = mapping;
                    mapping.set_containment_to_all(self.sender.number_of_slaves());
                    return self
                        .sender
                        .send_query_mapping_to_all(mapping, self.id, parent.id);
                }
                _ => {
                    // A sibling that also knows this mapping broadcasts it.
                    pool.release(mapping);
                    return Ok(());
                }
            }
        }
        let owner = match parent.first_join_var {
            Some(var) => {
                let value = mapping.value_of(var, own_result_vars)?;
                ((value >> 48) as u16) + 1
            }
            // Without join variables all instances agree on slave 1.
            None => 1,
        };
        if mapping.is_known_by(owner, clen) {
            if owner == local {
                self.sender
                    .send_query_mapping(mapping, self.id, parent.id.on_slave(local))
            } else {
                // The owner holds its own copy; ours would be a duplicate.
                pool.release(mapping);
                Ok(())
            }
        } else if mapping.first_knowing_slave(clen) == Some(local) {
            let mut mapping = mapping;
            mapping.update_containment(local, owner, clen);
            self.sender
                .send_query_mapping(mapping, self.id, parent.id.on_slave(owner))
        } else {
            pool.release(mapping);
            Ok(())
        }
    }
}

/// Operator-specific behavior plugged into the shared lifecycle.
pub trait QueryOperator: Send + Sync + std::fmt::Debug {
    fn base(&self) -> &TaskBase;

    /// Variable order of emitted mappings.
    fn result_variables(&self) -> &[u64];

    /// The smallest result variable, used by children for ownership routing.
    fn first_join_var(&self) -> Option<u64> {
        self.result_variables().iter().min().copied()
    }

    /// One-time setup on leaving `Created`.
    fn execute_pre_start_step(&self) -> Result<()> {
        Ok(())
    }

    /// One bounded increment of real work.
    fn execute_operation_step(&self) -> Result<()>;

    /// Whether this instance has produced everything it ever will.
    fn is_finished_locally(&self) -> bool;

    /// Runs on the transition out of `Started`; the default announces
    /// completion to siblings and, for roots, the coordinator.
    fn execute_final_step(&self) -> Result<()> {
        self.base().send_task_finished()
    }

    /// Runs on reaching `Finished`.
    fn tidy_up(&self) {}

    /// Operator-owned resources to drop on close.
    fn close_internal(&self) {}

    /// Messages the shared intake does not understand.
    fn handle_control_message(&self, data: &[u8]) -> Result<()> {
        Err(TesseraError::new(format!(
            "task {} cannot handle message tag {}",
            self.base().id(),
            data.first().copied().unwrap_or(0)
        )))
    }

    /// Measured load for rebalancing; defaults to queued input.
    fn current_load(&self) -> u64 {
        self.base().total_input_len()
    }

    /// Whether a source-style operator still has work outside its queues.
    fn has_source_input(&self) -> bool {
        false
    }
}

impl<T: QueryOperator> WorkerTask for T {
    fn id(&self) -> TaskId {
        self.base().id()
    }

    fn coordinator_id(&self) -> TaskId {
        self.base().coordinator()
    }

    fn estimated_load(&self) -> u64 {
        self.base().estimated_load()
    }

    fn current_load(&self) -> u64 {
        QueryOperator::current_load(self)
    }

    fn start(&self) {
        self.base().start();
    }

    fn is_started(&self) -> bool {
        self.base().is_started()
    }

    fn enqueue_message(&self, data: &[u8]) -> Result<()> {
        self.base()
            .enqueue_message(data, |data| self.handle_control_message(data))
    }

    fn execute(&self) -> Result<()> {
        self.base().execute_step(self)
    }

    fn has_input(&self) -> bool {
        self.base().has_queued_input() || self.has_source_input()
    }

    fn has_to_perform_final_steps(&self) -> bool {
        self.base().has_to_perform_final_steps()
    }

    fn is_in_final_state(&self) -> bool {
        self.base().is_in_final_state()
    }

    fn close(&self) {
        self.base().close(self);
    }

    fn children(&self) -> Vec<Arc<dyn WorkerTask>> {
        self.base().children().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::MessageTransport;
    use crate::message::registry::{MessageRouter, TaskRegistry};

    #[derive(Debug, Default)]
    struct NullTransport;

    impl MessageTransport for NullTransport {
        fn send(&self, _destination: u16, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn params(dir: &std::path::Path) -> TaskParams {
        let registry = Arc::new(TaskRegistry::new(1));
        let router = Arc::new(MessageRouter::new(registry));
        let pool = Arc::new(MappingPool::new(8, 1));
        let sender = Arc::new(MappingSender::new(
            1,
            1,
            10,
            pool,
            Arc::new(NullTransport),
            router,
        ));
        TaskParams {
            id: TaskId::new(1, 3, 1),
            coordinator: TaskId::new(0, 3, 0),
            sender,
            children: Vec::new(),
            estimated_load: 1,
            emitted_per_round: 10,
            input_queue_count: 1,
            queue_cache_size: 4,
            spill_directory: dir.to_path_buf(),
        }
    }

    /// Aborts itself from inside its own operation step, like a coordinator
    /// reacting to a reported slave failure.
    #[derive(Debug)]
    struct SelfClosing {
        base: TaskBase,
    }

    impl QueryOperator for SelfClosing {
        fn base(&self) -> &TaskBase {
            &self.base
        }

        fn result_variables(&self) -> &[u64] {
            &[]
        }

        fn execute_operation_step(&self) -> Result<()> {
            self.base.close(self);
            Ok(())
        }

        fn is_finished_locally(&self) -> bool {
            true
        }
    }

    #[test]
    fn abort_during_a_step_is_absorbing() {
        let dir = tempfile::tempdir().unwrap();
        let op = SelfClosing {
            base: TaskBase::new(params(dir.path())).unwrap(),
        };
        op.base.start();
        op.base.execute_step(&op).unwrap();
        assert_eq!(TaskState::Started, op.base.state());

        // The step aborts the task; the lifecycle must not push it on to
        // WaitingForOtherSlaves or Finished afterwards.
        op.base.execute_step(&op).unwrap();
        assert_eq!(TaskState::Aborted, op.base.state());
        op.base.execute_step(&op).unwrap();
        assert_eq!(TaskState::Aborted, op.base.state());
    }
}
