//! Master-side coordination of one query.
//!
//! The coordinator is itself a task scheduled on the master's worker ring.
//! It distributes the serialized execution tree, fires the start signal once
//! every slave has acknowledged creation, collects the root's mappings into
//! decoded result batches for the client, and applies the slice bounds that
//! never leave the master.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tessera_error::{Result, ResultExt, TesseraError};
use tracing::{debug, warn};

use super::task::{QueryOperator, TaskBase, TaskParams};
use super::tree::OperatorDef;
use crate::collab::{ClientChannel, Dictionary, GraphStatistics};
use crate::config::RuntimeConfig;
use crate::ident::TaskId;
use crate::message::codec;
use crate::message::sender::MappingSender;
use crate::message::types::MessageType;

/// `[tag][4B row count][utf8 rows]`, rows separated by `\n`, columns by `\t`.
fn encode_query_result(rows: &[String]) -> Vec<u8> {
    let mut buf = vec![MessageType::QueryResult as u8];
    buf.extend_from_slice(&(rows.len() as u32).to_be_bytes());
    buf.extend_from_slice(rows.join("\n").as_bytes());
    buf
}

fn encode_client_failed(message: &str) -> Vec<u8> {
    let mut buf = vec![MessageType::ClientCommandFailed as u8];
    buf.extend_from_slice(message.as_bytes());
    buf
}

#[derive(Debug)]
struct CoordinatorState {
    /// Slaves that have not yet acknowledged tree creation.
    missing_created: u16,
    /// Root instances that have not yet reported completion.
    missing_slave_finishes: u16,
    /// Result rows still to drop for the slice offset.
    remaining_offset: u64,
    /// Result rows still allowed under the slice limit.
    remaining_limit: Option<u64>,
    limit_exhausted: bool,
    failure: Option<String>,
    client_notified: bool,
    last_client_contact: Instant,
}

#[derive(Debug)]
pub struct QueryCoordinator {
    base: TaskBase,
    plan: OperatorDef,
    result_vars: Vec<u64>,
    emitted_per_round: usize,
    keep_alive_interval: Duration,
    stats: Arc<dyn GraphStatistics>,
    dictionary: Arc<dyn Dictionary>,
    client: Arc<dyn ClientChannel>,
    state: Mutex<CoordinatorState>,
}

impl QueryCoordinator {
    pub fn new(
        query: u32,
        plan: OperatorDef,
        config: &RuntimeConfig,
        sender: Arc<MappingSender>,
        stats: Arc<dyn GraphStatistics>,
        dictionary: Arc<dyn Dictionary>,
        client: Arc<dyn ClientChannel>,
    ) -> Result<Self> {
        let id = TaskId::new(0, query, 0);
        let params = TaskParams {
            id,
            coordinator: id,
            sender,
            children: Vec::new(),
            estimated_load: 0,
            emitted_per_round: config.emitted_mappings_per_round,
            input_queue_count: 1,
            queue_cache_size: config.receiver_queue_cache_size,
            spill_directory: config.spill_directory.clone(),
        };
        let (offset, limit) = plan.slice_bounds();
        let number_of_slaves = config.number_of_slaves;
        let result_vars = plan.result_variables();
        Ok(QueryCoordinator {
            base: TaskBase::new(params)?,
            plan,
            result_vars,
            emitted_per_round: config.emitted_mappings_per_round,
            keep_alive_interval: Duration::from_millis(config.keep_alive_interval_millis),
            stats,
            dictionary,
            client,
            state: Mutex::new(CoordinatorState {
                missing_created: number_of_slaves,
                missing_slave_finishes: number_of_slaves,
                remaining_offset: offset,
                remaining_limit: limit,
                limit_exhausted: limit == Some(0),
                failure: None,
                client_notified: false,
                last_client_contact: Instant::now(),
            }),
        })
    }

    pub fn query_id(&self) -> u32 {
        self.base.id().query()
    }

    fn decode_row(&self, mapping: &crate::mapping::Mapping) -> Result<String> {
        let mut columns = Vec::with_capacity(self.result_vars.len());
        for var in &self.result_vars {
            let value = mapping.value_of(*var, &self.result_vars)?;
            columns.push(self.dictionary.decode(value).context("decoding result")?);
        }
        Ok(columns.join("\t"))
    }

    /// Broadcast the abort signal and tell the client why the query died.
    fn fail(&self, message: String) -> Result<()> {
        warn!(query = self.query_id(), error = %message, "query failed");
        self.base.sender().send_query_abortion(self.query_id())?;
        {
            let mut state = self.state.lock();
            if !state.client_notified {
                self.client.send(&encode_client_failed(&message));
                state.client_notified = true;
            }
            state.failure = Some(message);
        }
        self.base.close(self);
        Ok(())
    }
}

impl QueryOperator for QueryCoordinator {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn result_variables(&self) -> &[u64] {
        &self.result_vars
    }

    /// Serialize and distribute the execution tree.
    fn execute_pre_start_step(&self) -> Result<()> {
        let query = self.query_id();
        let sender = self.base.sender();
        for slave in 1..=sender.number_of_slaves() {
            let tree = self.plan.serialize_for_slave(
                query,
                slave,
                self.base.id(),
                self.emitted_per_round,
                self.stats.as_ref(),
            );
            sender.send_query_create(slave, query, &tree)?;
        }
        debug!(query, "execution trees distributed");
        Ok(())
    }

    fn execute_operation_step(&self) -> Result<()> {
        let pending_failure = self.state.lock().failure.take();
        if let Some(message) = pending_failure {
            return self.fail(message);
        }
        let mut rows = Vec::new();
        let mut exhausted_now = false;
        for _ in 0..self.emitted_per_round {
            if self.state.lock().limit_exhausted {
                break;
            }
            let Some(mapping) = self.base.consume(0)? else {
                break;
            };
            let mut state = self.state.lock();
            if state.remaining_offset > 0 {
                state.remaining_offset -= 1;
                drop(state);
                self.base.pool().release(mapping);
                continue;
            }
            if let Some(limit) = state.remaining_limit.as_mut() {
                *limit -= 1;
                if *limit == 0 {
                    state.limit_exhausted = true;
                    exhausted_now = true;
                }
            }
            drop(state);
            let row = self.decode_row(&mapping);
            self.base.pool().release(mapping);
            rows.push(row?);
        }
        if !rows.is_empty() {
            self.client.send(&encode_query_result(&rows));
            self.state.lock().last_client_contact = Instant::now();
        } else {
            let mut state = self.state.lock();
            if state.last_client_contact.elapsed() >= self.keep_alive_interval {
                self.client.send(&[MessageType::MasterWorkInProgress as u8]);
                state.last_client_contact = Instant::now();
            }
        }
        if exhausted_now {
            // The slaves would keep producing results nobody wants.
            self.base.sender().send_query_abortion(self.query_id())?;
        }
        Ok(())
    }

    fn is_finished_locally(&self) -> bool {
        let state = self.state.lock();
        state.limit_exhausted
            || (state.missing_slave_finishes == 0 && self.base.input_queue_is_empty(0))
    }

    /// The coordinator has no siblings or parent to notify.
    fn execute_final_step(&self) -> Result<()> {
        Ok(())
    }

    fn tidy_up(&self) {
        let mut state = self.state.lock();
        if !state.client_notified {
            self.client
                .send(&[MessageType::ClientCommandSucceeded as u8]);
            state.client_notified = true;
        }
    }

    fn close_internal(&self) {
        let mut state = self.state.lock();
        if !state.client_notified {
            self.client.send(&[MessageType::ClientCommandAborted as u8]);
            state.client_notified = true;
        }
    }

    fn handle_control_message(&self, data: &[u8]) -> Result<()> {
        match MessageType::from_tag(data.first().copied().unwrap_or(0))? {
            MessageType::QueryCreated => {
                let (slave, _) = codec::decode_query_created(data)?;
                let fire_start = {
                    let mut state = self.state.lock();
                    state.missing_created = state.missing_created.saturating_sub(1);
                    state.missing_created == 0
                };
                debug!(query = self.query_id(), slave, "tree created");
                if fire_start {
                    self.base.sender().send_query_start(self.query_id())?;
                }
                Ok(())
            }
            MessageType::QueryTaskFinished => {
                match codec::decode_query_task_finished(data)? {
                    codec::TaskFinished::Coordinator { sender_slave, .. } => {
                        let mut state = self.state.lock();
                        state.missing_slave_finishes =
                            state.missing_slave_finishes.saturating_sub(1);
                        debug!(
                            query = self.query_id(),
                            slave = sender_slave,
                            missing = state.missing_slave_finishes,
                            "slave finished"
                        );
                    }
                    codec::TaskFinished::Sibling { .. } => {}
                }
                Ok(())
            }
            MessageType::QueryTaskFailed => {
                let (slave, _, message) = codec::decode_query_task_failed(data)?;
                self.state.lock().failure = Some(format!("slave {slave}: {message}"));
                Ok(())
            }
            other => Err(TesseraError::new(format!(
                "coordinator cannot handle {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InboundHandler, LoopbackTransport};
    use crate::mapping::MappingPool;
    use crate::message::registry::{MessageRouter, TaskRegistry};
    use crate::store::{Term, TriplePattern};

    #[derive(Debug, Default)]
    struct RecordingNode {
        messages: Mutex<Vec<Vec<u8>>>,
    }

    impl InboundHandler for RecordingNode {
        fn on_message(&self, data: &[u8]) {
            self.messages.lock().push(data.to_vec());
        }
    }

    #[derive(Debug, Default)]
    struct RecordingClient {
        messages: Mutex<Vec<Vec<u8>>>,
    }

    impl ClientChannel for RecordingClient {
        fn send(&self, data: &[u8]) {
            self.messages.lock().push(data.to_vec());
        }
    }

    #[derive(Debug)]
    struct NamedDictionary;

    impl Dictionary for NamedDictionary {
        fn decode(&self, id: u64) -> Result<String> {
            Ok(format!("r{id}"))
        }
    }

    #[derive(Debug)]
    struct FixedStats;

    impl GraphStatistics for FixedStats {
        fn estimated_matches(&self, _pattern: &TriplePattern, _slave: u16) -> u64 {
            1
        }
    }

    struct Fixture {
        coordinator: QueryCoordinator,
        client: Arc<RecordingClient>,
        slave: Arc<RecordingNode>,
        pool: Arc<MappingPool>,
        _dir: tempfile::TempDir,
    }

    fn fixture(limit: Option<u64>, offset: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            number_of_slaves: 1,
            local_slave: 0,
            spill_directory: dir.path().to_path_buf(),
            ..RuntimeConfig::default()
        };
        let transport = LoopbackTransport::new();
        let slave = Arc::new(RecordingNode::default());
        transport.register(1, slave.clone());
        let registry = Arc::new(TaskRegistry::new(0));
        let router = Arc::new(MessageRouter::new(registry));
        let pool = Arc::new(MappingPool::new(16, 1));
        let sender = Arc::new(MappingSender::new(
            0,
            1,
            10,
            pool.clone(),
            Arc::new(transport),
            router,
        ));
        let pattern = OperatorDef::pattern_match(TriplePattern::new(
            Term::Value(1),
            Term::Value(2),
            Term::Variable(7),
        ));
        let plan = OperatorDef::slice(OperatorDef::projection(vec![7], pattern), offset, limit);
        let client = Arc::new(RecordingClient::default());
        let coordinator = QueryCoordinator::new(
            5,
            plan,
            &config,
            sender,
            Arc::new(FixedStats),
            Arc::new(NamedDictionary),
            client.clone(),
        )
        .unwrap();
        Fixture {
            coordinator,
            client,
            slave,
            pool,
            _dir: dir,
        }
    }

    fn result_record(pool: &MappingPool, coordinator: TaskId, value: u64) -> Vec<u8> {
        let mut mapping = pool.create_with_values(&[value], &[0x80]);
        mapping.set_sender(TaskId::new(1, 5, 1));
        mapping.set_receiver(coordinator);
        mapping.as_bytes().to_vec()
    }

    #[test]
    fn start_fires_after_every_slave_acknowledged() {
        let f = fixture(None, 0);
        use crate::executor::WorkerTask;

        f.coordinator.start();
        f.coordinator.execute().unwrap();
        {
            let sent = f.slave.messages.lock();
            assert_eq!(1, sent.len());
            assert_eq!(MessageType::QueryCreate as u8, sent[0][0]);
        }

        f.coordinator
            .enqueue_message(&codec::encode_query_created(1, f.coordinator.id()))
            .unwrap();
        let sent = f.slave.messages.lock();
        assert_eq!(2, sent.len());
        assert_eq!(MessageType::QueryStart as u8, sent[1][0]);
    }

    #[test]
    fn results_are_decoded_batched_and_confirmed() {
        let f = fixture(None, 0);
        use crate::executor::WorkerTask;

        f.coordinator.start();
        f.coordinator.execute().unwrap();

        let id = f.coordinator.id();
        f.coordinator
            .enqueue_message(&result_record(&f.pool, id, 3))
            .unwrap();
        f.coordinator
            .enqueue_message(&result_record(&f.pool, id, 4))
            .unwrap();
        f.coordinator.execute().unwrap();
        {
            let sent = f.client.messages.lock();
            assert_eq!(1, sent.len());
            assert_eq!(MessageType::QueryResult as u8, sent[0][0]);
            assert_eq!(2, u32::from_be_bytes(sent[0][1..5].try_into().unwrap()));
            assert_eq!(b"r3\nr4", &sent[0][5..]);
        }

        f.coordinator
            .enqueue_message(&codec::encode_query_task_finished_to_coordinator(
                1,
                id,
                TaskId::new(1, 5, 1),
            ))
            .unwrap();
        f.coordinator.execute().unwrap();
        assert!(f.coordinator.is_in_final_state());
        let sent = f.client.messages.lock();
        assert_eq!(
            MessageType::ClientCommandSucceeded as u8,
            sent.last().unwrap()[0]
        );
    }

    #[test]
    fn offset_and_limit_bound_the_result() {
        let f = fixture(Some(1), 1);
        use crate::executor::WorkerTask;

        f.coordinator.start();
        f.coordinator.execute().unwrap();
        let id = f.coordinator.id();
        for value in [3, 4, 5] {
            f.coordinator
                .enqueue_message(&result_record(&f.pool, id, value))
                .unwrap();
        }
        f.coordinator.execute().unwrap();

        // The first row falls to the offset, the second is the entire limit.
        {
            let sent = f.client.messages.lock();
            assert_eq!(b"r4", &sent[0][5..]);
        }
        // Reaching the limit aborts the still-running slaves.
        assert_eq!(
            MessageType::QueryAbortion as u8,
            f.slave.messages.lock().last().unwrap()[0]
        );
        f.coordinator.execute().unwrap();
        assert!(f.coordinator.is_in_final_state());
        assert_eq!(
            MessageType::ClientCommandSucceeded as u8,
            f.client.messages.lock().last().unwrap()[0]
        );
    }

    #[test]
    fn slave_failure_aborts_and_reports() {
        let f = fixture(None, 0);
        use crate::executor::WorkerTask;

        f.coordinator.start();
        f.coordinator.execute().unwrap();
        f.coordinator
            .enqueue_message(&codec::encode_query_task_failed(
                1,
                f.coordinator.id(),
                "join blew up",
            ))
            .unwrap();
        f.coordinator.execute().unwrap();

        assert!(f.coordinator.is_in_final_state());
        assert_eq!(
            MessageType::QueryAbortion as u8,
            f.slave.messages.lock().last().unwrap()[0]
        );
        let sent = f.client.messages.lock();
        let failed = sent.last().unwrap();
        assert_eq!(MessageType::ClientCommandFailed as u8, failed[0]);
        assert_eq!(b"slave 1: join blew up", &failed[1..]);
    }
}
