//! Bounded pool of reusable mapping buffers.
//!
//! Mapping churn is high: every operator step allocates and drops records.
//! Released buffers are kept on a bounded free list and handed back out by
//! the constructors below instead of hitting the allocator each time.

use parking_lot::Mutex;
use tessera_error::Result;

use super::{HEADER_LEN, Mapping, containment_len, write_u64};
use crate::store::{IndexKind, TriplePattern};

#[derive(Debug)]
pub struct MappingPool {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    number_of_slaves: u16,
}

impl MappingPool {
    pub fn new(capacity: usize, number_of_slaves: u16) -> Self {
        MappingPool {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            number_of_slaves,
        }
    }

    pub fn number_of_slaves(&self) -> u16 {
        self.number_of_slaves
    }

    pub fn containment_len(&self) -> usize {
        containment_len(self.number_of_slaves)
    }

    fn take_buf(&self, len: usize) -> Vec<u8> {
        let mut buf = self.free.lock().pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Return a consumed mapping's buffer for reuse. Dropped if the pool is
    /// full.
    pub fn release(&self, mapping: Mapping) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(mapping.into_buf());
        }
    }

    /// Mapping binding no variables, known by no slave.
    pub fn create_empty(&self) -> Mapping {
        let mut buf = self.take_buf(HEADER_LEN + self.containment_len());
        Mapping::finish_header(&mut buf);
        Mapping::from_buf(buf)
    }

    /// Mapping with the given values bound in order and the given containment
    /// bytes.
    pub fn create_with_values(&self, values: &[u64], containment: &[u8]) -> Mapping {
        debug_assert_eq!(self.containment_len(), containment.len());
        let mut buf = self.take_buf(HEADER_LEN + values.len() * 8 + containment.len());
        for (i, value) in values.iter().enumerate() {
            write_u64(&mut buf, HEADER_LEN + i * 8, *value);
        }
        let start = buf.len() - containment.len();
        buf[start..].copy_from_slice(containment);
        Mapping::finish_header(&mut buf);
        Mapping::from_buf(buf)
    }

    /// Decode a stored triple against a pattern. One value per variable
    /// position in subject, property, object order; containment copied from
    /// the stored bytes.
    pub fn create_from_triple(
        &self,
        pattern: &TriplePattern,
        index: IndexKind,
        triple: &[u8],
    ) -> Mapping {
        let containment = &triple[24..];
        let num_vars = pattern.variables().len();
        let mut buf = self.take_buf(HEADER_LEN + num_vars * 8 + containment.len());

        let mut offset = HEADER_LEN;
        if pattern.subject_is_variable() {
            write_u64(&mut buf, offset, index.subject(triple));
            offset += 8;
        }
        if pattern.property_is_variable() {
            write_u64(&mut buf, offset, index.property(triple));
            offset += 8;
        }
        if pattern.object_is_variable() {
            write_u64(&mut buf, offset, index.object(triple));
            offset += 8;
        }
        buf[offset..].copy_from_slice(containment);
        Mapping::finish_header(&mut buf);
        Mapping::from_buf(buf)
    }

    /// Projection: keep only `kept_vars` slots, in their given order, plus
    /// the containment bitmap. A kept variable the source does not bind is
    /// an error.
    pub fn restrict(&self, kept_vars: &[u64], src: &Mapping, src_vars: &[u64]) -> Result<Mapping> {
        let clen = self.containment_len();
        let mut buf = self.take_buf(HEADER_LEN + kept_vars.len() * 8 + clen);
        for (slot, var) in kept_vars.iter().enumerate() {
            let value = src.value_of(*var, src_vars)?;
            write_u64(&mut buf, HEADER_LEN + slot * 8, value);
        }
        let start = buf.len() - clen;
        buf[start..].copy_from_slice(src.containment(clen));
        Mapping::finish_header(&mut buf);
        Ok(Mapping::from_buf(buf))
    }

    /// Join two mappings into the given result variable order.
    ///
    /// The empty mapping is the join identity: its partner's bytes are reused
    /// unchanged. Otherwise each result variable takes its value from
    /// whichever side binds it and the containment bitmaps are intersected,
    /// modeling that the joined fact is known only where both inputs are. A
    /// result variable bound on neither side is an error.
    pub fn merge(
        &self,
        result_vars: &[u64],
        left: &Mapping,
        left_vars: &[u64],
        right: &Mapping,
        right_vars: &[u64],
    ) -> Result<Mapping> {
        let clen = self.containment_len();
        if left.is_empty_mapping(clen) {
            let mut buf = self.take_buf(right.as_bytes().len());
            buf.copy_from_slice(right.as_bytes());
            return Ok(Mapping::from_buf(buf));
        }
        if right.is_empty_mapping(clen) {
            let mut buf = self.take_buf(left.as_bytes().len());
            buf.copy_from_slice(left.as_bytes());
            return Ok(Mapping::from_buf(buf));
        }

        let mut buf = self.take_buf(HEADER_LEN + result_vars.len() * 8 + clen);
        for (slot, var) in result_vars.iter().enumerate() {
            let value = match left.value_of(*var, left_vars) {
                Ok(v) => v,
                Err(_) => right.value_of(*var, right_vars)?,
            };
            write_u64(&mut buf, HEADER_LEN + slot * 8, value);
        }
        let start = buf.len() - clen;
        let left_cont = left.containment(clen);
        let right_cont = right.containment(clen);
        for i in 0..clen {
            buf[start + i] = left_cont[i] & right_cont[i];
        }
        Mapping::finish_header(&mut buf);
        Ok(Mapping::from_buf(buf))
    }

    pub fn clone_mapping(&self, mapping: &Mapping) -> Mapping {
        let mut buf = self.take_buf(mapping.as_bytes().len());
        buf.copy_from_slice(mapping.as_bytes());
        Mapping::from_buf(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_bounds_free_list() {
        let pool = MappingPool::new(1, 1);
        let a = pool.create_empty();
        let b = pool.create_empty();
        pool.release(a);
        pool.release(b);
        assert_eq!(1, pool.free.lock().len());
    }

    #[test]
    fn unbound_variables_are_rejected() {
        let pool = MappingPool::new(4, 1);
        let m = pool.create_with_values(&[5], &[0x80]);
        assert!(pool.restrict(&[999], &m, &[1]).is_err());

        let other = pool.create_with_values(&[6], &[0x80]);
        assert!(pool.merge(&[1, 2, 999], &m, &[1], &other, &[2]).is_err());
    }

    #[test]
    fn reused_buffer_is_reset() {
        let pool = MappingPool::new(4, 1);
        let m = pool.create_with_values(&[0xffff_ffff_ffff_ffff], &[0xff]);
        pool.release(m);
        let empty = pool.create_empty();
        assert!(empty.is_empty_mapping(1));
        assert_eq!(&[0u8], empty.containment(1));
    }
}
