//! Local triple index.

mod pattern;
mod triple_store;

pub use pattern::{PatternKind, Term, TriplePattern};
pub use triple_store::{ScanCursor, TripleStore};

/// Orientation of one of the three index permutations.
///
/// Stored keys are 24 bytes of permuted (subject, property, object) followed
/// by the containment bitmap; the orientation knows where each component
/// lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Spo,
    Osp,
    Pos,
}

impl IndexKind {
    pub fn subject(&self, triple: &[u8]) -> u64 {
        let offset = match self {
            IndexKind::Spo => 0,
            IndexKind::Osp => 8,
            IndexKind::Pos => 16,
        };
        crate::mapping::read_u64(triple, offset)
    }

    pub fn property(&self, triple: &[u8]) -> u64 {
        let offset = match self {
            IndexKind::Spo => 8,
            IndexKind::Osp => 16,
            IndexKind::Pos => 0,
        };
        crate::mapping::read_u64(triple, offset)
    }

    pub fn object(&self, triple: &[u8]) -> u64 {
        let offset = match self {
            IndexKind::Spo => 16,
            IndexKind::Osp => 0,
            IndexKind::Pos => 8,
        };
        crate::mapping::read_u64(triple, offset)
    }

    pub fn containment<'a>(&self, triple: &'a [u8]) -> &'a [u8] {
        &triple[24..]
    }
}
