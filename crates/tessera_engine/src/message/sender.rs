//! Outbound side of the message layer.
//!
//! Mappings destined for the same node are buffered and flushed as one
//! `QueryMappingBatch`. Control messages always flush the data buffers
//! first, preserving per-destination ordering between data and control.

use std::sync::Arc;

use parking_lot::Mutex;
use tessera_error::Result;
use tracing::warn;

use super::codec;
use super::registry::MessageRouter;
use crate::collab::MessageTransport;
use crate::ident::TaskId;
use crate::mapping::{Mapping, MappingPool};

pub const MASTER: u16 = 0;

/// Batched per-destination sender, shared by all tasks of a node.
#[derive(Debug)]
pub struct MappingSender {
    local_slave: u16,
    number_of_slaves: u16,
    bundle_size: usize,
    /// One buffer per destination; index 0 is the master.
    buffers: Mutex<Vec<Vec<Mapping>>>,
    pool: Arc<MappingPool>,
    transport: Arc<dyn MessageTransport>,
    router: Arc<MessageRouter>,
}

impl MappingSender {
    pub fn new(
        local_slave: u16,
        number_of_slaves: u16,
        bundle_size: usize,
        pool: Arc<MappingPool>,
        transport: Arc<dyn MessageTransport>,
        router: Arc<MessageRouter>,
    ) -> Self {
        let buffers = (0..=number_of_slaves as usize).map(|_| Vec::new()).collect();
        MappingSender {
            local_slave,
            number_of_slaves,
            bundle_size: std::cmp::max(1, bundle_size),
            buffers: Mutex::new(buffers),
            pool,
            transport,
            router,
        }
    }

    pub fn local_slave(&self) -> u16 {
        self.local_slave
    }

    pub fn number_of_slaves(&self) -> u16 {
        self.number_of_slaves
    }

    pub fn pool(&self) -> &Arc<MappingPool> {
        &self.pool
    }

    /// Send one mapping from `sender` to `receiver`. The mapping is consumed;
    /// local deliveries bypass the network and the buffers entirely.
    pub fn send_query_mapping(
        &self,
        mut mapping: Mapping,
        sender: TaskId,
        receiver: TaskId,
    ) -> Result<()> {
        mapping.set_sender(sender);
        mapping.set_receiver(receiver);
        let destination = receiver.slave();
        if destination == self.local_slave {
            self.router.route_record(mapping.as_bytes());
            self.pool.release(mapping);
            return Ok(());
        }
        let mut buffers = self.buffers.lock();
        let buffer = &mut buffers[destination as usize];
        buffer.push(mapping);
        if buffer.len() >= self.bundle_size {
            let batch = std::mem::take(buffer);
            drop(buffers);
            self.flush_batch(destination, batch)?;
        }
        Ok(())
    }

    /// Send a clone of the mapping to the receiver's instance on every
    /// slave. The local instance, if any, receives its copy last.
    pub fn send_query_mapping_to_all(
        &self,
        mapping: Mapping,
        sender: TaskId,
        receiver: TaskId,
    ) -> Result<()> {
        for slave in 1..=self.number_of_slaves {
            if slave == self.local_slave {
                continue;
            }
            let clone = self.pool.clone_mapping(&mapping);
            self.send_query_mapping(clone, sender, receiver.on_slave(slave))?;
        }
        if self.local_slave != MASTER {
            self.send_query_mapping(mapping, sender, receiver.on_slave(self.local_slave))?;
        } else {
            self.pool.release(mapping);
        }
        Ok(())
    }

    /// Flush every buffered destination.
    pub fn send_all_buffered_messages(&self) -> Result<()> {
        let drained: Vec<(u16, Vec<Mapping>)> = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter_mut()
                .enumerate()
                .filter(|(_, b)| !b.is_empty())
                .map(|(dest, b)| (dest as u16, std::mem::take(b)))
                .collect()
        };
        for (destination, batch) in drained {
            self.flush_batch(destination, batch)?;
        }
        Ok(())
    }

    fn flush_batch(&self, destination: u16, batch: Vec<Mapping>) -> Result<()> {
        let encoded =
            codec::encode_mapping_batch(self.local_slave, batch.iter().map(|m| m.as_bytes()));
        self.transport.send(destination, &encoded)?;
        for mapping in batch {
            self.pool.release(mapping);
        }
        Ok(())
    }

    /// Notify all sibling instances (and the coordinator, for tree roots)
    /// that `task` has finished on this slave.
    pub fn send_query_task_finished(
        &self,
        task: TaskId,
        is_root: bool,
        coordinator: TaskId,
    ) -> Result<()> {
        self.send_all_buffered_messages()?;
        for slave in 1..=self.number_of_slaves {
            if slave == self.local_slave {
                continue;
            }
            self.send_to(slave, &codec::encode_query_task_finished(self.local_slave, task))?;
        }
        if is_root {
            self.send_to(
                coordinator.slave(),
                &codec::encode_query_task_finished_to_coordinator(
                    self.local_slave,
                    coordinator,
                    task,
                ),
            )?;
        }
        Ok(())
    }

    pub fn send_query_task_failed(&self, coordinator: TaskId, message: &str) -> Result<()> {
        if let Err(e) = self.send_all_buffered_messages() {
            warn!(error = %e, "flush before failure report failed");
        }
        self.send_to(
            coordinator.slave(),
            &codec::encode_query_task_failed(self.local_slave, coordinator, message),
        )
    }

    pub fn send_query_create(&self, slave: u16, query: u32, tree: &[u8]) -> Result<()> {
        self.send_to(slave, &codec::encode_query_create(query, tree))
    }

    pub fn send_query_created(&self, coordinator: TaskId) -> Result<()> {
        self.send_to(
            coordinator.slave(),
            &codec::encode_query_created(self.local_slave, coordinator),
        )
    }

    /// Broadcast the start signal for a created query to all slaves.
    pub fn send_query_start(&self, query: u32) -> Result<()> {
        let encoded = codec::encode_query_start(query);
        for slave in 1..=self.number_of_slaves {
            self.send_to(slave, &encoded)?;
        }
        Ok(())
    }

    /// Broadcast an abort for the query to all slaves.
    pub fn send_query_abortion(&self, query: u32) -> Result<()> {
        self.send_all_buffered_messages()?;
        let encoded = codec::encode_query_abortion(query);
        for slave in 1..=self.number_of_slaves {
            self.send_to(slave, &encoded)?;
        }
        Ok(())
    }

    fn send_to(&self, destination: u16, data: &[u8]) -> Result<()> {
        if destination == self.local_slave {
            self.router.process(data);
            Ok(())
        } else {
            self.transport.send(destination, data)
        }
    }
}
