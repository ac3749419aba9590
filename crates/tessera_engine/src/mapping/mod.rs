//! Partial query results ("mappings") and their binary representation.
//!
//! A mapping binds a subset of the query variables to encoded values and
//! records in a trailing bitmap which slaves already know this result. The
//! byte layout is exactly what goes over the wire inside a mapping batch:
//!
//! ```text
//! [1B tag][8B receiver id][8B sender id][4B total length]
//! [8B value per bound variable][containment bitmap]
//! ```
//!
//! The variable order of the value section is a contract between a producer
//! and its consumer; both sides know the producer's result variable list and
//! index into the value section through it.

mod pool;

pub use pool::MappingPool;

use tessera_error::{Result, TesseraError};

use crate::ident::TaskId;
use crate::message::types::MessageType;

/// Byte offset of the receiver id.
pub const OFFSET_RECEIVER: usize = 1;
/// Byte offset of the sender id.
pub const OFFSET_SENDER: usize = 9;
/// Byte offset of the 4-byte total length field.
pub const OFFSET_LENGTH: usize = 17;
/// Length of the fixed header preceding the value section.
pub const HEADER_LEN: usize = 21;

/// Bytes in a containment bitmap for the given cluster size.
pub const fn containment_len(number_of_slaves: u16) -> usize {
    (number_of_slaves as usize).div_ceil(8)
}

/// One partial variable binding, owning its backing bytes.
///
/// Mappings are move-only. Once handed to the message layer or released back
/// to a [`MappingPool`] the producer must not touch the bytes again; the type
/// system enforces this by consuming `self` at those call sites.
#[derive(Debug, PartialEq, Eq)]
pub struct Mapping {
    buf: Vec<u8>,
}

impl Mapping {
    /// Wrap raw record bytes. The slice must be a complete record including
    /// the header.
    pub fn from_bytes(bytes: &[u8]) -> Mapping {
        Mapping {
            buf: bytes.to_vec(),
        }
    }

    pub(crate) fn from_buf(buf: Vec<u8>) -> Mapping {
        Mapping { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn into_buf(self) -> Vec<u8> {
        self.buf
    }

    pub fn receiver(&self) -> TaskId {
        TaskId(read_u64(&self.buf, OFFSET_RECEIVER))
    }

    pub fn set_receiver(&mut self, receiver: TaskId) {
        write_u64(&mut self.buf, OFFSET_RECEIVER, receiver.0);
    }

    pub fn sender(&self) -> TaskId {
        TaskId(read_u64(&self.buf, OFFSET_SENDER))
    }

    pub fn set_sender(&mut self, sender: TaskId) {
        write_u64(&mut self.buf, OFFSET_SENDER, sender.0);
    }

    /// Total record length as recorded in the header.
    pub fn total_len(&self) -> usize {
        read_u32(&self.buf, OFFSET_LENGTH) as usize
    }

    pub fn num_vars(&self, containment_len: usize) -> usize {
        (self.buf.len() - HEADER_LEN - containment_len) / 8
    }

    /// A mapping with no bound variables, the join identity.
    pub fn is_empty_mapping(&self, containment_len: usize) -> bool {
        self.buf.len() == HEADER_LEN + containment_len
    }

    /// Value bound to `var`, given the variable order of this mapping's
    /// producer.
    pub fn value_of(&self, var: u64, vars_in_scope: &[u64]) -> Result<u64> {
        let slot = vars_in_scope
            .iter()
            .position(|v| *v == var)
            .ok_or_else(|| TesseraError::new(format!("variable {var} not bound in mapping")))?;
        let offset = HEADER_LEN + slot * 8;
        if offset + 8 > self.buf.len() {
            return Err(TesseraError::new(format!(
                "variable {var} at slot {slot} exceeds mapping of {} bytes",
                self.buf.len()
            )));
        }
        Ok(read_u64(&self.buf, offset))
    }

    fn containment_start(&self, containment_len: usize) -> usize {
        self.buf.len() - containment_len
    }

    pub fn containment(&self, containment_len: usize) -> &[u8] {
        &self.buf[self.containment_start(containment_len)..]
    }

    /// Whether `slave` (1-based) already knows this result.
    pub fn is_known_by(&self, slave: u16, containment_len: usize) -> bool {
        let start = self.containment_start(containment_len);
        let idx = (slave as usize - 1) / 8;
        let mask = 0x80u8 >> ((slave as usize - 1) % 8);
        self.buf[start + idx] & mask != 0
    }

    /// Lowest slave id whose containment bit is set, if any.
    pub fn first_knowing_slave(&self, containment_len: usize) -> Option<u16> {
        let start = self.containment_start(containment_len);
        for (byte_idx, byte) in self.buf[start..].iter().enumerate() {
            if *byte != 0 {
                let bit = byte.leading_zeros() as usize;
                return Some((byte_idx * 8 + bit + 1) as u16);
            }
        }
        None
    }

    /// Mark the result as known by every slave. Bits past the cluster size in
    /// the last partial byte stay clear.
    pub fn set_containment_to_all(&mut self, number_of_slaves: u16) {
        let containment_len = containment_len(number_of_slaves);
        let start = self.containment_start(containment_len);
        for byte in &mut self.buf[start..] {
            *byte = 0xff;
        }
        let rem = number_of_slaves as usize % 8;
        if rem != 0 {
            let last = self.buf.len() - 1;
            self.buf[last] = 0xffu8 << (8 - rem);
        }
    }

    /// Clear the bit of `current` and set the bit of `next`, both 1-based.
    pub fn update_containment(&mut self, current: u16, next: u16, containment_len: usize) {
        let start = self.containment_start(containment_len);
        let cur_idx = (current as usize - 1) / 8;
        let cur_mask = 0x80u8 >> ((current as usize - 1) % 8);
        self.buf[start + cur_idx] &= !cur_mask;
        let next_idx = (next as usize - 1) / 8;
        let next_mask = 0x80u8 >> ((next as usize - 1) % 8);
        self.buf[start + next_idx] |= next_mask;
    }

    pub(crate) fn finish_header(buf: &mut Vec<u8>) {
        buf[0] = MessageType::QueryMappingBatch as u8;
        let len = buf.len() as u32;
        write_u32(buf, OFFSET_LENGTH, len);
    }
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

pub(crate) fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(num_slaves: u16) -> MappingPool {
        MappingPool::new(16, num_slaves)
    }

    fn mapping_with(pool: &MappingPool, values: &[u64], containment: &[u8]) -> Mapping {
        pool.create_with_values(values, containment)
    }

    #[test]
    fn empty_mapping_detection() {
        let pool = pool(3);
        let empty = pool.create_empty();
        assert!(empty.is_empty_mapping(containment_len(3)));
        let nonempty = mapping_with(&pool, &[7], &[0b1000_0000]);
        assert!(!nonempty.is_empty_mapping(containment_len(3)));
    }

    #[test]
    fn value_lookup_by_scope() {
        let pool = pool(1);
        let m = mapping_with(&pool, &[10, 20, 30], &[0b1000_0000]);
        let vars = [100u64, 200, 300];
        assert_eq!(10, m.value_of(100, &vars).unwrap());
        assert_eq!(30, m.value_of(300, &vars).unwrap());
        assert!(m.value_of(999, &vars).is_err());
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let pool = pool(2);
        let m = mapping_with(&pool, &[1, 2], &[0b1100_0000]);
        let empty = pool.create_empty();
        let joined = pool.merge(&[100, 200], &m, &[100, 200], &empty, &[]).unwrap();
        assert_eq!(m.as_bytes(), joined.as_bytes());

        let joined = pool.merge(&[100, 200], &empty, &[], &m, &[100, 200]).unwrap();
        assert_eq!(m.as_bytes(), joined.as_bytes());
    }

    #[test]
    fn merge_intersects_containment() {
        // {1,2} AND {2,3} == {2}
        let pool = pool(3);
        let left = mapping_with(&pool, &[5], &[0b1100_0000]);
        let right = mapping_with(&pool, &[5, 6], &[0b0110_0000]);
        let joined = pool.merge(&[100, 200], &left, &[100], &right, &[100, 200]).unwrap();
        assert_eq!(&[0b0100_0000], joined.containment(containment_len(3)));
        assert_eq!(5, joined.value_of(100, &[100, 200]).unwrap());
        assert_eq!(6, joined.value_of(200, &[100, 200]).unwrap());
    }

    #[test]
    fn restrict_is_idempotent() {
        let pool = pool(2);
        let m = mapping_with(&pool, &[1, 2, 3], &[0b1000_0000]);
        let src_vars = [100u64, 200, 300];
        let kept = [300u64, 100];
        let once = pool.restrict(&kept, &m, &src_vars).unwrap();
        let twice = pool.restrict(&kept, &once, &kept).unwrap();
        assert_eq!(once.as_bytes(), twice.as_bytes());
        assert_eq!(3, once.value_of(300, &kept).unwrap());
        assert_eq!(1, once.value_of(100, &kept).unwrap());
    }

    #[test]
    fn containment_bit_positions() {
        let pool = pool(10);
        let clen = containment_len(10);
        let mut m = mapping_with(&pool, &[], &[0, 0]);
        m.update_containment(1, 9, clen);
        assert!(m.is_known_by(9, clen));
        assert!(!m.is_known_by(1, clen));
        assert_eq!(Some(9), m.first_knowing_slave(clen));
    }

    #[test]
    fn set_containment_to_all_masks_partial_byte() {
        let pool = pool(10);
        let clen = containment_len(10);
        let mut m = mapping_with(&pool, &[], &[0, 0]);
        m.set_containment_to_all(10);
        assert_eq!(&[0xff, 0b1100_0000], m.containment(clen));
        for slave in 1..=10 {
            assert!(m.is_known_by(slave, clen));
        }
    }

    #[test]
    fn receiver_sender_round_trip() {
        let pool = pool(1);
        let mut m = mapping_with(&pool, &[1], &[0x80]);
        m.set_receiver(TaskId::new(2, 7, 3));
        m.set_sender(TaskId::new(1, 7, 4));
        assert_eq!(TaskId::new(2, 7, 3), m.receiver());
        assert_eq!(TaskId::new(1, 7, 4), m.sender());
        assert_eq!(m.as_bytes().len(), m.total_len());
    }
}
