//! In-process cluster harness and collaborator stand-ins for tests.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tessera_error::Result;

use crate::collab::{ClientChannel, Dictionary, GraphStatistics, LoopbackTransport};
use crate::config::RuntimeConfig;
use crate::executor::WorkerManager;
use crate::mapping::containment_len;
use crate::message::types::MessageType;
use crate::query::{OperatorDef, QueryCoordinator};
use crate::store::{TriplePattern, TripleStore};

/// Containment bitmap marking a triple as held by exactly one slave.
pub fn containment(slave: u16, number_of_slaves: u16) -> Vec<u8> {
    let mut bytes = vec![0u8; containment_len(number_of_slaves)];
    bytes[(slave as usize - 1) / 8] |= 0x80 >> ((slave - 1) % 8);
    bytes
}

/// Decodes resource ids to `r{id}`.
#[derive(Debug, Default)]
pub struct SimpleDictionary;

impl Dictionary for SimpleDictionary {
    fn decode(&self, id: u64) -> Result<String> {
        Ok(format!("r{id}"))
    }
}

/// Exact per-slave match counts taken from the slave stores themselves.
#[derive(Debug)]
pub struct StoreStatistics {
    stores: Vec<Arc<TripleStore>>,
}

impl StoreStatistics {
    pub fn new(stores: Vec<Arc<TripleStore>>) -> Self {
        StoreStatistics { stores }
    }
}

impl GraphStatistics for StoreStatistics {
    fn estimated_matches(&self, pattern: &TriplePattern, slave: u16) -> u64 {
        self.stores[slave as usize - 1].count(pattern)
    }
}

/// Records everything sent to the client and exposes it decoded.
#[derive(Debug, Default)]
pub struct CollectingClient {
    messages: Mutex<Vec<Vec<u8>>>,
}

impl ClientChannel for CollectingClient {
    fn send(&self, data: &[u8]) {
        self.messages.lock().push(data.to_vec());
    }
}

impl CollectingClient {
    /// All result rows received so far, in arrival order.
    pub fn rows(&self) -> Vec<String> {
        let mut rows = Vec::new();
        for message in self.messages.lock().iter() {
            if message.first() == Some(&(MessageType::QueryResult as u8)) && message.len() > 5 {
                let text = String::from_utf8_lossy(&message[5..]);
                rows.extend(text.split('\n').map(str::to_owned));
            }
        }
        rows
    }

    /// The final command status tag, if one has arrived.
    pub fn terminal_status(&self) -> Option<u8> {
        self.messages.lock().iter().rev().find_map(|m| {
            let tag = *m.first()?;
            if tag == MessageType::ClientCommandSucceeded as u8
                || tag == MessageType::ClientCommandFailed as u8
                || tag == MessageType::ClientCommandAborted as u8
            {
                Some(tag)
            } else {
                None
            }
        })
    }

    /// Poll until a terminal status arrives or the deadline passes.
    pub fn wait_for_terminal(&self, deadline: Duration) -> Option<u8> {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if let Some(tag) = self.terminal_status() {
                return Some(tag);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }
}

/// A master and its slaves wired over a loopback transport, each with its
/// own worker ring.
pub struct TestCluster {
    pub master: Arc<WorkerManager>,
    pub slaves: Vec<Arc<WorkerManager>>,
    pub stores: Vec<Arc<TripleStore>>,
    next_query: AtomicU32,
}

impl TestCluster {
    /// One store per slave; the cluster size follows from the store count.
    pub fn start(stores: Vec<Arc<TripleStore>>, spill_root: &Path) -> Self {
        let number_of_slaves = stores.len() as u16;
        let transport = LoopbackTransport::new();
        let node_config = |local_slave: u16| RuntimeConfig {
            number_of_slaves,
            local_slave,
            spill_directory: spill_root.join(format!("node{local_slave}")),
            worker_threads: 2,
            idle_sleep_millis: 1,
            ..RuntimeConfig::default()
        };
        let master = Arc::new(WorkerManager::new(
            node_config(0),
            Arc::new(transport.clone()),
            Arc::new(TripleStore::new()),
        ));
        transport.register(0, master.clone());
        let mut slaves = Vec::with_capacity(stores.len());
        for (i, store) in stores.iter().enumerate() {
            let slave = (i + 1) as u16;
            let manager = Arc::new(WorkerManager::new(
                node_config(slave),
                Arc::new(transport.clone()),
                store.clone(),
            ));
            transport.register(slave, manager.clone());
            slaves.push(manager);
        }
        TestCluster {
            master,
            slaves,
            stores,
            next_query: AtomicU32::new(1),
        }
    }

    /// Submit a plan through a fresh coordinator; results arrive at `client`.
    pub fn submit(&self, plan: OperatorDef, client: Arc<CollectingClient>) -> Result<u32> {
        let query = self.next_query.fetch_add(1, Ordering::Relaxed);
        let coordinator = Arc::new(QueryCoordinator::new(
            query,
            plan,
            self.master.config(),
            self.master.sender().clone(),
            Arc::new(StoreStatistics::new(self.stores.clone())),
            Arc::new(SimpleDictionary),
            client,
        )?);
        self.master.submit_query(coordinator)?;
        Ok(query)
    }

    pub fn shutdown(&self) {
        self.master.shutdown();
        for slave in &self.slaves {
            slave.shutdown();
        }
    }
}
