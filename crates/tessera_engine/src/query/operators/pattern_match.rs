//! Leaf operator streaming matches of one triple pattern out of the store.

use std::sync::Arc;

use parking_lot::Mutex;
use tessera_error::Result;

use crate::query::task::{QueryOperator, TaskBase, TaskParams};
use crate::store::{ScanCursor, TriplePattern, TripleStore};

#[derive(Debug)]
struct ScanState {
    cursor: Option<ScanCursor>,
    exhausted: bool,
}

/// Streams lazily decoded mappings for every stored triple matching the
/// pattern, up to the per-round emission budget per step.
#[derive(Debug)]
pub struct PatternMatchOperator {
    base: TaskBase,
    pattern: TriplePattern,
    result_vars: Vec<u64>,
    store: Arc<TripleStore>,
    scan: Mutex<ScanState>,
}

impl PatternMatchOperator {
    pub fn new(params: TaskParams, pattern: TriplePattern, store: Arc<TripleStore>) -> Result<Self> {
        let result_vars = pattern.variables();
        let estimated_load = params.estimated_load;
        let base = TaskBase::new(params)?;
        Ok(PatternMatchOperator {
            base,
            pattern,
            result_vars,
            store,
            scan: Mutex::new(ScanState {
                cursor: None,
                // A zero cost estimate means the pattern cannot match here.
                exhausted: estimated_load == 0,
            }),
        })
    }

    pub fn pattern(&self) -> &TriplePattern {
        &self.pattern
    }
}

impl QueryOperator for PatternMatchOperator {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn result_variables(&self) -> &[u64] {
        &self.result_vars
    }

    fn execute_operation_step(&self) -> Result<()> {
        let mut scan = self.scan.lock();
        if scan.exhausted {
            return Ok(());
        }
        let (matches, next) = self.store.scan_chunk(
            &self.pattern,
            scan.cursor.as_ref(),
            self.base.emitted_per_round(),
        );
        let index = TripleStore::index_for(self.pattern.kind());
        for triple in matches {
            let mapping = self
                .base
                .pool()
                .create_from_triple(&self.pattern, index, &triple);
            self.base.emit_mapping(mapping, &self.result_vars)?;
        }
        match next {
            Some(cursor) => scan.cursor = Some(cursor),
            None => scan.exhausted = true,
        }
        Ok(())
    }

    fn is_finished_locally(&self) -> bool {
        self.scan.lock().exhausted
    }

    fn has_source_input(&self) -> bool {
        !self.scan.lock().exhausted
    }

    fn current_load(&self) -> u64 {
        if self.scan.lock().exhausted {
            0
        } else {
            self.base.estimated_load()
        }
    }
}
