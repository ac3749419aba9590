//! Inbound routing: the local task registry and the message router.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tessera_error::{Result, TesseraError};
use tracing::warn;

use super::codec::{self, TaskFinished};
use super::types::MessageType;
use crate::executor::WorkerTask;
use crate::ident::TaskId;

/// All task instances currently live on this node, keyed by their full local
/// identifier.
///
/// Read-mostly: worker threads and the network receiver look tasks up far
/// more often than queries register or retire them.
#[derive(Debug)]
pub struct TaskRegistry {
    local_slave: u16,
    tasks: RwLock<HashMap<u64, Arc<dyn WorkerTask>>>,
}

impl TaskRegistry {
    pub fn new(local_slave: u16) -> Self {
        TaskRegistry {
            local_slave,
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_slave(&self) -> u16 {
        self.local_slave
    }

    /// Register a task under its identifier. Registering a different task
    /// under a live identifier is an error.
    pub fn register(&self, task: Arc<dyn WorkerTask>) -> Result<()> {
        let id = task.id();
        let mut tasks = self.tasks.write();
        if let Some(existing) = tasks.get(&id.0) {
            if Arc::ptr_eq(existing, &task) {
                return Ok(());
            }
            return Err(TesseraError::new(format!(
                "task {id} is already registered to a different task"
            )));
        }
        tasks.insert(id.0, task);
        Ok(())
    }

    pub fn deregister(&self, id: TaskId) {
        self.tasks.write().remove(&id.0);
    }

    /// Look a task up by any instance id of the same logical node; the slave
    /// portion is normalized to this node.
    pub fn get(&self, id: TaskId) -> Option<Arc<dyn WorkerTask>> {
        let local = id.on_slave(self.local_slave);
        self.tasks.read().get(&local.0).cloned()
    }

    pub fn tasks_of_query(&self, query: u32) -> Vec<Arc<dyn WorkerTask>> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.id().query() == query)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

/// Routes inbound data and control messages to registered tasks.
///
/// Protocol errors are terminal for the offending message only: it is
/// dropped with a log, the router itself never fails.
#[derive(Debug)]
pub struct MessageRouter {
    registry: Arc<TaskRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        MessageRouter { registry }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Deliver one mapping record to its receiver task.
    pub fn route_record(&self, record: &[u8]) {
        let receiver = codec::record_receiver(record);
        match self.registry.get(receiver) {
            Some(task) => {
                if let Err(e) = task.enqueue_message(record) {
                    warn!(%receiver, error = %e, "discarding mapping for task");
                }
            }
            None => {
                warn!(%receiver, "discarding mapping for unknown task");
            }
        }
    }

    /// Process one inbound message. Unknown tags and unroutable receivers
    /// are logged and dropped.
    pub fn process(&self, data: &[u8]) {
        if data.is_empty() {
            warn!("discarding empty message");
            return;
        }
        let message_type = match MessageType::from_tag(data[0]) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "discarding message");
                return;
            }
        };
        match message_type {
            MessageType::QueryMappingBatch => {
                let records = match codec::BatchRecords::new(data) {
                    Ok((_, records)) => records,
                    Err(e) => {
                        warn!(error = %e, "discarding mapping batch");
                        return;
                    }
                };
                for record in records {
                    match record {
                        Ok(record) => self.route_record(record),
                        Err(e) => {
                            warn!(error = %e, "discarding remainder of mapping batch");
                            return;
                        }
                    }
                }
            }
            MessageType::QueryTaskFinished => {
                let target = match codec::decode_query_task_finished(data) {
                    Ok(TaskFinished::Sibling { task, .. }) => task,
                    Ok(TaskFinished::Coordinator { coordinator, .. }) => coordinator,
                    Err(e) => {
                        warn!(error = %e, "discarding task finished message");
                        return;
                    }
                };
                self.deliver_control(target, data);
            }
            MessageType::QueryCreated => match codec::decode_query_created(data) {
                Ok((_, coordinator)) => self.deliver_control(coordinator, data),
                Err(e) => warn!(error = %e, "discarding query created message"),
            },
            MessageType::QueryTaskFailed => match codec::decode_query_task_failed(data) {
                Ok((_, coordinator, _)) => self.deliver_control(coordinator, data),
                Err(e) => warn!(error = %e, "discarding task failed message"),
            },
            other => {
                warn!(?other, "message type not handled by the task router");
            }
        }
    }

    fn deliver_control(&self, target: TaskId, data: &[u8]) {
        match self.registry.get(target) {
            Some(task) => {
                if let Err(e) = task.enqueue_message(data) {
                    warn!(%target, error = %e, "discarding control message for task");
                }
            }
            None => {
                warn!(%target, tag = data[0], "discarding control message for unknown task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::mapping::MappingPool;
    use crate::message::codec::encode_mapping_batch;

    #[derive(Debug)]
    struct RecordingTask {
        id: TaskId,
        received: Mutex<Vec<Vec<u8>>>,
        reject: AtomicBool,
    }

    impl RecordingTask {
        fn new(id: TaskId) -> Arc<Self> {
            Arc::new(RecordingTask {
                id,
                received: Mutex::new(Vec::new()),
                reject: AtomicBool::new(false),
            })
        }
    }

    impl WorkerTask for RecordingTask {
        fn id(&self) -> TaskId {
            self.id
        }
        fn coordinator_id(&self) -> TaskId {
            TaskId::new(0, self.id.query(), 0)
        }
        fn estimated_load(&self) -> u64 {
            0
        }
        fn current_load(&self) -> u64 {
            0
        }
        fn start(&self) {}
        fn is_started(&self) -> bool {
            true
        }
        fn enqueue_message(&self, data: &[u8]) -> Result<()> {
            if self.reject.load(Ordering::Relaxed) {
                return Err(TesseraError::new("queue closed"));
            }
            self.received.lock().push(data.to_vec());
            Ok(())
        }
        fn execute(&self) -> Result<()> {
            Ok(())
        }
        fn has_input(&self) -> bool {
            false
        }
        fn has_to_perform_final_steps(&self) -> bool {
            false
        }
        fn is_in_final_state(&self) -> bool {
            false
        }
        fn close(&self) {}
        fn children(&self) -> Vec<Arc<dyn WorkerTask>> {
            Vec::new()
        }
    }

    #[test]
    fn register_rejects_conflicting_task() {
        let registry = TaskRegistry::new(1);
        let id = TaskId::new(1, 0, 1);
        let a = RecordingTask::new(id);
        let b = RecordingTask::new(id);
        registry.register(a.clone()).unwrap();
        registry.register(a.clone()).unwrap();
        assert!(registry.register(b).is_err());
    }

    #[test]
    fn lookup_normalizes_slave_portion() {
        let registry = TaskRegistry::new(2);
        let task = RecordingTask::new(TaskId::new(2, 5, 3));
        registry.register(task).unwrap();
        // Addressed with the sender's slave portion.
        assert!(registry.get(TaskId::new(1, 5, 3)).is_some());
        assert!(registry.get(TaskId::new(1, 5, 4)).is_none());
    }

    #[test]
    fn batch_records_are_routed_individually() {
        let registry = Arc::new(TaskRegistry::new(1));
        let a = RecordingTask::new(TaskId::new(1, 0, 1));
        let b = RecordingTask::new(TaskId::new(1, 0, 2));
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        let router = MessageRouter::new(registry);

        let pool = MappingPool::new(4, 1);
        let mut to_a = pool.create_with_values(&[7], &[0x80]);
        to_a.set_receiver(TaskId::new(1, 0, 1));
        let mut to_b = pool.create_with_values(&[8], &[0x80]);
        to_b.set_receiver(TaskId::new(1, 0, 2));
        let mut to_unknown = pool.create_with_values(&[9], &[0x80]);
        to_unknown.set_receiver(TaskId::new(1, 0, 9));

        let batch = encode_mapping_batch(
            1,
            [to_a.as_bytes(), to_unknown.as_bytes(), to_b.as_bytes()].into_iter(),
        );
        router.process(&batch);

        assert_eq!(1, a.received.lock().len());
        assert_eq!(1, b.received.lock().len());
    }

    #[test]
    fn rejected_delivery_does_not_fail_the_router() {
        let registry = Arc::new(TaskRegistry::new(1));
        let task = RecordingTask::new(TaskId::new(1, 0, 1));
        task.reject.store(true, Ordering::Relaxed);
        registry.register(task.clone()).unwrap();
        let router = MessageRouter::new(registry);

        let pool = MappingPool::new(4, 1);
        let mut mapping = pool.create_with_values(&[7], &[0x80]);
        mapping.set_receiver(TaskId::new(1, 0, 1));
        router.route_record(mapping.as_bytes());

        assert!(task.received.lock().is_empty());
    }

    #[test]
    fn unknown_tag_is_dropped_quietly() {
        let registry = Arc::new(TaskRegistry::new(1));
        let router = MessageRouter::new(registry);
        router.process(&[99, 1, 2, 3]);
        router.process(&[]);
    }
}
