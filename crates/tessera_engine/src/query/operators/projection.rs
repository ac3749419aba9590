//! Projection operator.

use tessera_error::Result;

use crate::query::task::{QueryOperator, TaskBase, TaskParams};

/// Restricts each consumed mapping to the declared result variables.
#[derive(Debug)]
pub struct ProjectionOperator {
    base: TaskBase,
    result_vars: Vec<u64>,
    child_result_vars: Vec<u64>,
}

impl ProjectionOperator {
    pub fn new(
        params: TaskParams,
        result_vars: Vec<u64>,
        child_result_vars: Vec<u64>,
    ) -> Result<Self> {
        Ok(ProjectionOperator {
            base: TaskBase::new(params)?,
            result_vars,
            child_result_vars,
        })
    }
}

impl QueryOperator for ProjectionOperator {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn result_variables(&self) -> &[u64] {
        &self.result_vars
    }

    fn execute_operation_step(&self) -> Result<()> {
        for _ in 0..self.base.emitted_per_round() {
            let Some(mapping) = self.base.consume(0)? else {
                break;
            };
            let restricted =
                self.base
                    .pool()
                    .restrict(&self.result_vars, &mapping, &self.child_result_vars)?;
            self.base.emit_mapping(restricted, &self.result_vars)?;
            self.base.pool().release(mapping);
        }
        Ok(())
    }

    fn is_finished_locally(&self) -> bool {
        self.base.input_queue_is_empty(0)
    }
}
