//! 64-bit task addressing.
//!
//! Every node of a query execution tree is addressed by a 64-bit identifier
//! laid out as `{2 byte slave id}{4 byte query id}{2 byte task id}`. The same
//! logical tree node exists once per slave; the instances differ only in the
//! slave portion of their identifiers.

use std::fmt;

/// Identifier of one task instance on one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    pub const fn new(slave: u16, query: u32, task: u16) -> Self {
        TaskId(((slave as u64) << 48) | ((query as u64) << 16) | task as u64)
    }

    pub const fn slave(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub const fn query(&self) -> u32 {
        (self.0 >> 16) as u32
    }

    pub const fn task(&self) -> u16 {
        self.0 as u16
    }

    /// The same logical task addressed on a different slave.
    pub const fn on_slave(&self, slave: u16) -> TaskId {
        TaskId((self.0 & 0x0000_ffff_ffff_ffff) | ((slave as u64) << 48))
    }

    /// Identifier with the slave portion cleared, shared by all instances of
    /// one logical tree node.
    pub const fn logical(&self) -> u64 {
        self.0 & 0x0000_ffff_ffff_ffff
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.slave(), self.query(), self.task())
    }
}

impl From<u64> for TaskId {
    fn from(raw: u64) -> Self {
        TaskId(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        for &(slave, query, task) in &[
            (0u16, 0u32, 0u16),
            (1, 0, 0),
            (3, 7, 2),
            (u16::MAX, u32::MAX, u16::MAX),
            (42, 0xdead_beef, 513),
        ] {
            let id = TaskId::new(slave, query, task);
            assert_eq!(slave, id.slave());
            assert_eq!(query, id.query());
            assert_eq!(task, id.task());
        }
    }

    #[test]
    fn on_slave_replaces_high_bits() {
        let id = TaskId::new(2, 9, 4);
        let moved = id.on_slave(5);
        assert_eq!(5, moved.slave());
        assert_eq!(9, moved.query());
        assert_eq!(4, moved.task());
        assert_eq!(id.logical(), moved.logical());
    }
}
