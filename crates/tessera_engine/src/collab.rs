//! Trait seams towards out-of-scope collaborators.
//!
//! Parsing, dictionary encoding, statistics, client connection handling, and
//! the network transport are conventional plumbing owned by other components;
//! the runtime only consumes them through these traits.

use std::fmt::Debug;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tessera_error::{Result, TesseraError};

use crate::store::TriplePattern;

/// Decodes integer resource ids back to their external representation.
pub trait Dictionary: Debug + Send + Sync {
    fn decode(&self, id: u64) -> Result<String>;
}

/// Cost estimates over the loaded graph.
pub trait GraphStatistics: Debug + Send + Sync {
    /// Estimated number of matches of `pattern` on the given slave.
    fn estimated_matches(&self, pattern: &TriplePattern, slave: u16) -> u64;
}

/// Channel back to the client that submitted the query.
pub trait ClientChannel: Debug + Send + Sync {
    fn send(&self, data: &[u8]);
}

/// Delivers whole messages to another node of the cluster.
///
/// Destination 0 is the master; 1..=N are the slaves. Delivery must preserve
/// per-destination send order.
pub trait MessageTransport: Debug + Send + Sync {
    fn send(&self, destination: u16, data: &[u8]) -> Result<()>;
}

/// Inbound side of a node, fed by a transport.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, data: &[u8]);
}

/// In-process transport connecting the nodes of a simulated cluster.
///
/// Messages are delivered synchronously on the sending thread, which
/// trivially preserves per-destination ordering.
#[derive(Debug, Default, Clone)]
pub struct LoopbackTransport {
    nodes: Arc<RwLock<HashMap<u16, Arc<dyn InboundHandler>>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport::default()
    }

    pub fn register(&self, node: u16, handler: Arc<dyn InboundHandler>) {
        self.nodes.write().insert(node, handler);
    }
}

impl MessageTransport for LoopbackTransport {
    fn send(&self, destination: u16, data: &[u8]) -> Result<()> {
        let handler = self
            .nodes
            .read()
            .get(&destination)
            .cloned()
            .ok_or_else(|| TesseraError::new(format!("no node registered as {destination}")))?;
        handler.on_message(data);
        Ok(())
    }
}

impl std::fmt::Debug for dyn InboundHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundHandler").finish_non_exhaustive()
    }
}
