//! Triple store over three ordered index permutations.

use std::collections::BTreeSet;
use std::ops::Bound;

use parking_lot::RwLock;

use super::{IndexKind, PatternKind, Term, TriplePattern};

/// Resume point of an incremental pattern scan.
///
/// Scans are single-pass: operators pull one chunk per scheduling round and
/// hand the cursor back for the next round. `None` after a chunk means the
/// scan is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    last_key: Vec<u8>,
}

#[derive(Debug, Default)]
struct Indices {
    spo: BTreeSet<Vec<u8>>,
    osp: BTreeSet<Vec<u8>>,
    pos: BTreeSet<Vec<u8>>,
}

/// In-memory triple index, write-once per load cycle, read-mostly afterwards.
///
/// Every triple is stored three times, once per permutation, so any bound
/// prefix of a pattern maps to a contiguous key range of exactly one index.
#[derive(Debug, Default)]
pub struct TripleStore {
    indices: RwLock<Indices>,
}

impl TripleStore {
    pub fn new() -> Self {
        TripleStore::default()
    }

    /// Insert one triple with its containment bitmap into all three indices.
    pub fn insert(&self, subject: u64, property: u64, object: u64, containment: &[u8]) {
        let mut indices = self.indices.write();
        indices
            .spo
            .insert(make_key(subject, property, object, containment));
        indices
            .osp
            .insert(make_key(object, subject, property, containment));
        indices
            .pos
            .insert(make_key(property, object, subject, containment));
    }

    pub fn len(&self) -> usize {
        self.indices.read().spo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The index orientation serving the given pattern shape.
    pub fn index_for(kind: PatternKind) -> IndexKind {
        match kind {
            PatternKind::Unbound | PatternKind::S | PatternKind::Sp | PatternKind::Spo => {
                IndexKind::Spo
            }
            PatternKind::O | PatternKind::So => IndexKind::Osp,
            PatternKind::P | PatternKind::Po => IndexKind::Pos,
        }
    }

    /// Fetch up to `max` stored triples matching `pattern`, resuming after
    /// `cursor`. Returns the matches (in index key order) and the cursor for
    /// the next chunk, or `None` when the scan is exhausted.
    pub fn scan_chunk(
        &self,
        pattern: &TriplePattern,
        cursor: Option<&ScanCursor>,
        max: usize,
    ) -> (Vec<Vec<u8>>, Option<ScanCursor>) {
        let prefix = scan_prefix(pattern);
        let indices = self.indices.read();
        let index = match Self::index_for(pattern.kind()) {
            IndexKind::Spo => &indices.spo,
            IndexKind::Osp => &indices.osp,
            IndexKind::Pos => &indices.pos,
        };

        let lower = match cursor {
            Some(cursor) => Bound::Excluded(cursor.last_key.clone()),
            None => Bound::Included(prefix.clone()),
        };

        let mut matches = Vec::new();
        let mut more = false;
        for key in index.range((lower, Bound::Unbounded)) {
            if !key.starts_with(&prefix) {
                break;
            }
            if matches.len() == max {
                more = true;
                break;
            }
            matches.push(key.clone());
        }

        let next = if more {
            matches.last().map(|key| ScanCursor {
                last_key: key.clone(),
            })
        } else {
            None
        };
        (matches, next)
    }

    /// Number of stored triples matching the pattern.
    pub fn count(&self, pattern: &TriplePattern) -> u64 {
        let mut total = 0u64;
        let mut cursor = None;
        loop {
            let (matches, next) = self.scan_chunk(pattern, cursor.as_ref(), 1024);
            total += matches.len() as u64;
            match next {
                Some(c) => cursor = Some(c),
                None => return total,
            }
        }
    }
}

fn make_key(first: u64, second: u64, third: u64, containment: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(24 + containment.len());
    key.extend_from_slice(&first.to_be_bytes());
    key.extend_from_slice(&second.to_be_bytes());
    key.extend_from_slice(&third.to_be_bytes());
    key.extend_from_slice(containment);
    key
}

/// Minimal key prefix covering the pattern's bound positions under its
/// serving index.
fn scan_prefix(pattern: &TriplePattern) -> Vec<u8> {
    let bound = |term: Term| match term {
        Term::Value(v) => Some(v),
        Term::Variable(_) => None,
    };
    let components: [Option<u64>; 3] = match pattern.kind() {
        PatternKind::Unbound => [None, None, None],
        PatternKind::S => [bound(pattern.subject), None, None],
        PatternKind::Sp => [bound(pattern.subject), bound(pattern.property), None],
        PatternKind::Spo => [
            bound(pattern.subject),
            bound(pattern.property),
            bound(pattern.object),
        ],
        PatternKind::O => [bound(pattern.object), None, None],
        PatternKind::So => [bound(pattern.object), bound(pattern.subject), None],
        PatternKind::P => [bound(pattern.property), None, None],
        PatternKind::Po => [bound(pattern.property), bound(pattern.object), None],
    };
    let mut prefix = Vec::with_capacity(24);
    for component in components.into_iter().flatten() {
        prefix.extend_from_slice(&component.to_be_bytes());
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(triples: &[(u64, u64, u64)]) -> TripleStore {
        let store = TripleStore::new();
        for &(s, p, o) in triples {
            store.insert(s, p, o, &[0x80]);
        }
        store
    }

    fn var(v: u64) -> Term {
        Term::Variable(v)
    }

    fn val(v: u64) -> Term {
        Term::Value(v)
    }

    #[test]
    fn every_pattern_shape_finds_the_triple() {
        let store = store_with(&[(1, 2, 3)]);
        let patterns = [
            TriplePattern::new(var(10), var(11), var(12)),
            TriplePattern::new(val(1), var(11), var(12)),
            TriplePattern::new(var(10), val(2), var(12)),
            TriplePattern::new(var(10), var(11), val(3)),
            TriplePattern::new(val(1), val(2), var(12)),
            TriplePattern::new(val(1), var(11), val(3)),
            TriplePattern::new(var(10), val(2), val(3)),
            TriplePattern::new(val(1), val(2), val(3)),
        ];
        for pattern in patterns {
            let (matches, next) = store.scan_chunk(&pattern, None, 16);
            assert_eq!(1, matches.len(), "pattern {:?}", pattern.kind());
            assert!(next.is_none());
            let index = TripleStore::index_for(pattern.kind());
            assert_eq!(1, index.subject(&matches[0]));
            assert_eq!(2, index.property(&matches[0]));
            assert_eq!(3, index.object(&matches[0]));
        }
    }

    #[test]
    fn bound_mismatch_finds_nothing() {
        let store = store_with(&[(1, 2, 3)]);
        let pattern = TriplePattern::new(val(1), val(2), val(4));
        let (matches, next) = store.scan_chunk(&pattern, None, 16);
        assert!(matches.is_empty());
        assert!(next.is_none());
    }

    #[test]
    fn chunked_scan_resumes_without_duplicates() {
        let store = store_with(&[(1, 2, 3), (1, 2, 4), (1, 2, 5), (1, 9, 9), (5, 2, 3)]);
        let pattern = TriplePattern::new(val(1), val(2), var(12));

        let (chunk1, cursor) = store.scan_chunk(&pattern, None, 2);
        assert_eq!(2, chunk1.len());
        let cursor = cursor.unwrap();

        let (chunk2, cursor) = store.scan_chunk(&pattern, Some(&cursor), 2);
        assert_eq!(1, chunk2.len());
        assert!(cursor.is_none());

        let mut objects: Vec<u64> = chunk1
            .iter()
            .chain(chunk2.iter())
            .map(|t| IndexKind::Spo.object(t))
            .collect();
        objects.sort_unstable();
        assert_eq!(vec![3, 4, 5], objects);
    }

    #[test]
    fn unbound_pattern_scans_whole_store() {
        let store = store_with(&[(1, 2, 3), (4, 5, 6), (7, 8, 9)]);
        let pattern = TriplePattern::new(var(1), var(2), var(3));
        assert_eq!(3, store.count(&pattern));
    }
}
