//! Per-node runtime assembly.
//!
//! A `WorkerManager` owns everything one cluster node needs to execute
//! queries: the task registry, the message router, the batched sender, and
//! the worker thread ring. It is also the node's inbound message handler;
//! query lifecycle messages are handled here and everything else is routed
//! to the addressed task.

use std::sync::Arc;
use std::time::Duration;

use tessera_error::Result;
use tracing::{debug, warn};

use super::WorkerTask;
use super::worker::WorkerRing;
use crate::collab::{InboundHandler, MessageTransport};
use crate::config::RuntimeConfig;
use crate::ident::TaskId;
use crate::mapping::{MappingPool, read_u64};
use crate::message::codec;
use crate::message::registry::{MessageRouter, TaskRegistry};
use crate::message::sender::MappingSender;
use crate::message::types::MessageType;
use crate::query::QueryCoordinator;
use crate::query::tree;
use crate::store::TripleStore;

#[derive(Debug)]
pub struct WorkerManager {
    config: RuntimeConfig,
    registry: Arc<TaskRegistry>,
    router: Arc<MessageRouter>,
    sender: Arc<MappingSender>,
    store: Arc<TripleStore>,
    ring: WorkerRing,
}

impl WorkerManager {
    pub fn new(
        config: RuntimeConfig,
        transport: Arc<dyn MessageTransport>,
        store: Arc<TripleStore>,
    ) -> Self {
        let registry = Arc::new(TaskRegistry::new(config.local_slave));
        let router = Arc::new(MessageRouter::new(registry.clone()));
        let pool = Arc::new(MappingPool::new(
            config.mapping_pool_size,
            config.number_of_slaves,
        ));
        let sender = Arc::new(MappingSender::new(
            config.local_slave,
            config.number_of_slaves,
            config.mapping_bundle_size,
            pool,
            transport,
            router.clone(),
        ));
        let ring = WorkerRing::spawn(
            config.effective_worker_threads(),
            Duration::from_millis(config.idle_sleep_millis),
            config.unbalance_threshold,
            registry.clone(),
            sender.clone(),
        );
        WorkerManager {
            config,
            registry,
            router,
            sender,
            store,
            ring,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn sender(&self) -> &Arc<MappingSender> {
        &self.sender
    }

    pub fn store(&self) -> &Arc<TripleStore> {
        &self.store
    }

    /// Master side: schedule a coordinator on the local ring and let it
    /// drive the query.
    pub fn submit_query(&self, coordinator: Arc<QueryCoordinator>) -> Result<()> {
        let task: Arc<dyn WorkerTask> = coordinator;
        self.registry.register(task.clone())?;
        task.start();
        self.ring.assign(task);
        Ok(())
    }

    /// Slave side: instantiate a received tree, place its tasks, and
    /// acknowledge towards the coordinator.
    pub fn create_query(&self, query: u32, tree_bytes: &[u8]) -> Result<()> {
        let tree = tree::instantiate_tree(tree_bytes, &self.config, &self.sender, &self.store)?;
        debug!(query, tasks = tree.tasks.len(), "query instantiated");
        for (i, task) in tree.tasks.iter().enumerate() {
            if let Err(e) = self.registry.register(task.clone()) {
                // Nothing of this tree reached a worker yet, so nobody else
                // will retire the entries registered so far. Unwind them or
                // the query id stays wedged.
                for registered in &tree.tasks[..i] {
                    self.registry.deregister(registered.id());
                }
                return Err(e);
            }
        }
        // Children are placed before their parents, biasing early placement
        // towards the tree's sources.
        for task in tree.tasks {
            self.ring.assign(task);
        }
        self.sender.send_query_created(tree.coordinator)
    }

    pub fn start_query(&self, query: u32) {
        for task in self.registry.tasks_of_query(query) {
            task.start();
        }
    }

    /// Close every local task of the query; the workers drop and deregister
    /// them on their next sweep.
    pub fn abort_query(&self, query: u32) {
        for task in self.registry.tasks_of_query(query) {
            task.close();
        }
    }

    pub fn process_message(&self, data: &[u8]) -> Result<()> {
        match MessageType::from_tag(data.first().copied().unwrap_or(0))? {
            MessageType::QueryCreate => {
                let (query, tree_bytes) = codec::decode_query_create(data)?;
                if let Err(e) = self.create_query(query, tree_bytes) {
                    warn!(query, error = %e.msg(), "query creation failed");
                    if tree_bytes.len() < 9 {
                        return Err(e);
                    }
                    let coordinator = TaskId(read_u64(tree_bytes, 1));
                    self.abort_query(query);
                    self.sender.send_query_task_failed(coordinator, e.msg())?;
                }
                Ok(())
            }
            MessageType::QueryStart => {
                self.start_query(codec::decode_query_start(data)?);
                Ok(())
            }
            MessageType::QueryAbortion => {
                self.abort_query(codec::decode_query_abortion(data)?);
                Ok(())
            }
            _ => {
                self.router.process(data);
                Ok(())
            }
        }
    }

    pub fn shutdown(&self) {
        self.ring.shutdown();
    }
}

impl InboundHandler for WorkerManager {
    fn on_message(&self, data: &[u8]) {
        if let Err(e) = self.process_message(data) {
            warn!(error = %e.msg(), "inbound message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use parking_lot::Mutex;

    use super::*;
    use crate::query::OperatorDef;
    use crate::store::{Term, TriplePattern};

    #[derive(Debug, Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<(u16, Vec<u8>)>>,
    }

    impl MessageTransport for CapturingTransport {
        fn send(&self, destination: u16, data: &[u8]) -> Result<()> {
            self.sent.lock().push((destination, data.to_vec()));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FixedStats(u64);

    impl crate::collab::GraphStatistics for FixedStats {
        fn estimated_matches(&self, _pattern: &TriplePattern, _slave: u16) -> u64 {
            self.0
        }
    }

    /// Estimates each pattern at its bound property value, giving tests
    /// direct control over per-task load skew.
    #[derive(Debug)]
    struct SkewedStats;

    impl crate::collab::GraphStatistics for SkewedStats {
        fn estimated_matches(&self, pattern: &TriplePattern, _slave: u16) -> u64 {
            pattern.property.raw()
        }
    }

    #[derive(Debug)]
    struct PlaceholderTask {
        id: TaskId,
    }

    impl WorkerTask for PlaceholderTask {
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
            false
        }
        fn enqueue_message(&self, _data: &[u8]) -> Result<()> {
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

    fn slave_manager(dir: &std::path::Path) -> (WorkerManager, Arc<CapturingTransport>) {
        let config = RuntimeConfig {
            number_of_slaves: 1,
            local_slave: 1,
            spill_directory: dir.to_path_buf(),
            worker_threads: 2,
            // Keep placement observable: no migrations during the test.
            unbalance_threshold: u64::MAX,
            ..RuntimeConfig::default()
        };
        let transport = Arc::new(CapturingTransport::default());
        let manager = WorkerManager::new(config, transport.clone(), Arc::new(TripleStore::new()));
        (manager, transport)
    }

    fn plan() -> OperatorDef {
        let left = OperatorDef::pattern_match(TriplePattern::new(
            Term::Variable(1),
            Term::Value(10),
            Term::Variable(2),
        ));
        let right = OperatorDef::pattern_match(TriplePattern::new(
            Term::Variable(2),
            Term::Value(11),
            Term::Variable(3),
        ));
        OperatorDef::projection(vec![1, 3], OperatorDef::join(left, right))
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn create_registers_places_and_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = slave_manager(dir.path());
        let coordinator = TaskId::new(0, 4, 0);
        let tree = plan().serialize_for_slave(4, 1, coordinator, 100, &FixedStats(5));

        manager
            .process_message(&codec::encode_query_create(4, &tree))
            .unwrap();

        assert_eq!(4, manager.registry().tasks_of_query(4).len());
        // Greedy placement by estimated load spreads tasks over both workers.
        for worker in manager.ring.workers() {
            assert!(worker.task_count() > 0);
        }
        let sent = transport.sent.lock();
        let (destination, data) = sent.last().unwrap();
        assert_eq!(0, *destination);
        assert_eq!(MessageType::QueryCreated as u8, data[0]);
        drop(sent);
        manager.shutdown();
    }

    #[test]
    fn placement_keeps_worker_loads_within_one_task_weight() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _transport) = slave_manager(dir.path());
        let coordinator = TaskId::new(0, 4, 0);

        // Property values double as match estimates, so the tree's task
        // weights span several orders of magnitude.
        let m = |property: u64, s: u64, o: u64| {
            OperatorDef::pattern_match(TriplePattern::new(
                Term::Variable(s),
                Term::Value(property),
                Term::Variable(o),
            ))
        };
        let inner = OperatorDef::join(m(400, 1, 2), m(1, 2, 3));
        let outer = OperatorDef::join(inner, m(7, 3, 4));
        let skewed = OperatorDef::projection(vec![1, 4], outer);
        let tree = skewed.serialize_for_slave(4, 1, coordinator, 100, &SkewedStats);

        manager
            .process_message(&codec::encode_query_create(4, &tree))
            .unwrap();

        let heaviest = manager
            .registry()
            .tasks_of_query(4)
            .iter()
            .map(|t| t.estimated_load())
            .max()
            .unwrap();
        let loads: Vec<u64> = manager
            .ring
            .workers()
            .iter()
            .map(|w| w.estimated_load())
            .collect();
        let max = *loads.iter().max().unwrap();
        let min = *loads.iter().min().unwrap();
        assert!(
            max - min <= heaviest,
            "worker loads {loads:?} diverge by more than one task weight"
        );
        manager.shutdown();
    }

    #[test]
    fn failed_creation_unwinds_partial_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = slave_manager(dir.path());
        let coordinator = TaskId::new(0, 4, 0);
        // The incoming tree's join task collides with a live registration.
        let occupant: Arc<dyn WorkerTask> = Arc::new(PlaceholderTask {
            id: TaskId::new(1, 4, 2),
        });
        manager.registry().register(occupant.clone()).unwrap();

        let tree = plan().serialize_for_slave(4, 1, coordinator, 100, &FixedStats(5));
        manager
            .process_message(&codec::encode_query_create(4, &tree))
            .unwrap();

        // Only the pre-existing registration survives; the partially
        // registered tree is unwound and nothing reaches a worker.
        let remaining = manager.registry().tasks_of_query(4);
        assert_eq!(1, remaining.len());
        assert!(Arc::ptr_eq(&remaining[0], &occupant));
        for worker in manager.ring.workers() {
            assert_eq!(0, worker.task_count());
        }
        let sent = transport.sent.lock();
        let (destination, data) = sent.last().unwrap();
        assert_eq!(0, *destination);
        assert_eq!(MessageType::QueryTaskFailed as u8, data[0]);
        drop(sent);
        manager.shutdown();
    }

    #[test]
    fn abortion_clears_the_query() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _transport) = slave_manager(dir.path());
        let coordinator = TaskId::new(0, 4, 0);
        let tree = plan().serialize_for_slave(4, 1, coordinator, 100, &FixedStats(5));
        manager
            .process_message(&codec::encode_query_create(4, &tree))
            .unwrap();

        manager
            .process_message(&codec::encode_query_abortion(4))
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            manager.registry().is_empty()
        }));
        manager.shutdown();
    }

    #[test]
    fn malformed_tree_reports_failure_to_the_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, transport) = slave_manager(dir.path());
        let coordinator = TaskId::new(0, 4, 0);
        let mut tree = Vec::new();
        tree.push(0u8);
        tree.extend_from_slice(&coordinator.0.to_be_bytes());
        tree.extend_from_slice(&99u32.to_be_bytes());

        manager
            .process_message(&codec::encode_query_create(4, &tree))
            .unwrap();

        let sent = transport.sent.lock();
        let (destination, data) = sent.last().unwrap();
        assert_eq!(0, *destination);
        assert_eq!(MessageType::QueryTaskFailed as u8, data[0]);
        drop(sent);
        manager.shutdown();
    }
}
