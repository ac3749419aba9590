//! Symmetric hash join.
//!
//! Both inputs are retained in hash-bucketed, spill-capable sets. Each
//! consumed mapping probes the opposite side's bucket for join partners and
//! is then added to its own side, so every matching pair is produced exactly
//! once regardless of arrival order.

use tessera_error::{Result, TesseraError};

use parking_lot::Mutex;

use super::spill_set::{CandidateCursor, MappingSpillSet, bucket_for};
use crate::mapping::Mapping;
use crate::query::task::{QueryOperator, TaskBase, TaskParams};

/// How the two inputs combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// Natural join over the shared variables.
    Join = 0,
    /// No shared variables; every pair matches.
    Cartesian = 1,
    /// The right child binds no variables and acts as an existence filter
    /// for the left input.
    LeftForward = 2,
    /// Mirror of `LeftForward`.
    RightForward = 3,
}

impl JoinKind {
    pub fn from_wire(value: u32) -> Result<JoinKind> {
        Ok(match value {
            0 => JoinKind::Join,
            1 => JoinKind::Cartesian,
            2 => JoinKind::LeftForward,
            3 => JoinKind::RightForward,
            other => return Err(TesseraError::new(format!("unknown join kind: {other}"))),
        })
    }

    /// Derive the kind from the children's result variable lists.
    pub fn for_children(left_vars: &[u64], right_vars: &[u64]) -> JoinKind {
        if right_vars.is_empty() {
            JoinKind::LeftForward
        } else if left_vars.is_empty() {
            JoinKind::RightForward
        } else if left_vars.iter().any(|v| right_vars.contains(v)) {
            JoinKind::Join
        } else {
            JoinKind::Cartesian
        }
    }
}

/// Variables bound by both children, sorted. Result order is the left
/// child's variables followed by the right-only ones.
pub fn join_variables(left_vars: &[u64], right_vars: &[u64]) -> Vec<u64> {
    let mut shared: Vec<u64> = left_vars
        .iter()
        .filter(|v| right_vars.contains(v))
        .copied()
        .collect();
    shared.sort_unstable();
    shared.dedup();
    shared
}

pub fn result_variables(left_vars: &[u64], right_vars: &[u64]) -> Vec<u64> {
    let mut result = left_vars.to_vec();
    for var in right_vars {
        if !result.contains(var) {
            result.push(*var);
        }
    }
    result
}

#[derive(Debug)]
struct Probe {
    mapping: Mapping,
    from_left: bool,
    bucket: usize,
    cursor: CandidateCursor,
}

#[derive(Debug)]
struct JoinState {
    left: MappingSpillSet,
    right: MappingSpillSet,
    probe: Option<Probe>,
}

#[derive(Debug)]
pub struct HashJoinOperator {
    base: TaskBase,
    kind: JoinKind,
    left_vars: Vec<u64>,
    right_vars: Vec<u64>,
    join_vars: Vec<u64>,
    result_vars: Vec<u64>,
    state: Mutex<JoinState>,
}

impl HashJoinOperator {
    pub fn new(
        params: TaskParams,
        kind: JoinKind,
        left_vars: Vec<u64>,
        right_vars: Vec<u64>,
        cache_size: usize,
        bucket_count: usize,
    ) -> Result<Self> {
        let join_dir = params
            .spill_directory
            .join(format!("query_{}", params.id.query()))
            .join(format!("task_{}", params.id.task()))
            .join("join");
        let state = JoinState {
            left: MappingSpillSet::new(cache_size, bucket_count, join_dir.clone(), "left")?,
            right: MappingSpillSet::new(cache_size, bucket_count, join_dir, "right")?,
            probe: None,
        };
        let join_vars = join_variables(&left_vars, &right_vars);
        let result_vars = result_variables(&left_vars, &right_vars);
        Ok(HashJoinOperator {
            base: TaskBase::new(params)?,
            kind,
            left_vars,
            right_vars,
            join_vars,
            result_vars,
            state: Mutex::new(state),
        })
    }

    fn vars_of_side(&self, left: bool) -> &[u64] {
        if left { &self.left_vars } else { &self.right_vars }
    }

    /// The existence-filter side of a forward join keeps a single marker
    /// mapping.
    fn is_marker_side(&self, left: bool) -> bool {
        match self.kind {
            JoinKind::LeftForward => !left,
            JoinKind::RightForward => left,
            _ => false,
        }
    }

    fn key_bucket(&self, mapping: &Mapping, left: bool, bucket_count: usize) -> Result<usize> {
        match self.join_vars.first() {
            Some(var) => {
                let value = mapping.value_of(*var, self.vars_of_side(left))?;
                Ok(bucket_for(value, bucket_count))
            }
            None => Ok(0),
        }
    }

    fn join_values_match(&self, probe: &Probe, candidate: &Mapping) -> Result<bool> {
        let probe_vars = self.vars_of_side(probe.from_left);
        let candidate_vars = self.vars_of_side(!probe.from_left);
        for var in &self.join_vars {
            if probe.mapping.value_of(*var, probe_vars)?
                != candidate.value_of(*var, candidate_vars)?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Emit join partners of the pending probe until its cursor or the
    /// budget run out. Candidates are streamed off the opposite side one at
    /// a time, never collected. Returns how many were emitted.
    fn advance_probe(&self, state: &mut JoinState, budget: usize) -> Result<usize> {
        let Some(mut probe) = state.probe.take() else {
            return Ok(0);
        };
        let mut emitted = 0;
        while emitted < budget {
            let other = if probe.from_left {
                &mut state.right
            } else {
                &mut state.left
            };
            let Some(candidate) = other.next_candidate(&mut probe.cursor)? else {
                // Probe drained; the mapping joins its own side.
                let own = if probe.from_left {
                    &mut state.left
                } else {
                    &mut state.right
                };
                own.add(probe.mapping, probe.bucket)?;
                return Ok(emitted);
            };
            if self.join_values_match(&probe, &candidate)? {
                let merged = if probe.from_left {
                    self.base.pool().merge(
                        &self.result_vars,
                        &probe.mapping,
                        &self.left_vars,
                        &candidate,
                        &self.right_vars,
                    )?
                } else {
                    self.base.pool().merge(
                        &self.result_vars,
                        &candidate,
                        &self.left_vars,
                        &probe.mapping,
                        &self.right_vars,
                    )?
                };
                self.base.emit_mapping(merged, &self.result_vars)?;
                emitted += 1;
            }
            self.base.pool().release(candidate);
        }
        state.probe = Some(probe);
        Ok(emitted)
    }

    /// Which side to consume from next: the one with the smaller retained
    /// set, provided it has input.
    fn next_side(&self, state: &JoinState) -> Option<bool> {
        let left_ready = !self.base.input_queue_is_empty(0);
        let right_ready = !self.base.input_queue_is_empty(1);
        match (left_ready, right_ready) {
            (true, true) => Some(state.left.len() <= state.right.len()),
            (true, false) => Some(true),
            (false, true) => Some(false),
            (false, false) => None,
        }
    }
}

impl QueryOperator for HashJoinOperator {
    fn base(&self) -> &TaskBase {
        &self.base
    }

    fn result_variables(&self) -> &[u64] {
        &self.result_vars
    }

    fn execute_operation_step(&self) -> Result<()> {
        let budget = self.base.emitted_per_round();
        let mut state = self.state.lock();
        let mut emitted = self.advance_probe(&mut state, budget)?;
        while emitted < budget && state.probe.is_none() {
            let Some(from_left) = self.next_side(&state) else {
                break;
            };
            let queue = if from_left { 0 } else { 1 };
            let Some(mapping) = self.base.consume(queue)? else {
                break;
            };
            if self.is_marker_side(from_left) {
                let own = if from_left { &state.left } else { &state.right };
                if !own.is_empty() {
                    // One marker proves existence; the rest are duplicates.
                    self.base.pool().release(mapping);
                    continue;
                }
            }
            let bucket_count = state.left.bucket_count();
            let bucket = self.key_bucket(&mapping, from_left, bucket_count)?;
            let other = if from_left {
                &mut state.right
            } else {
                &mut state.left
            };
            let cursor = other.cursor(bucket)?;
            state.probe = Some(Probe {
                mapping,
                from_left,
                bucket,
                cursor,
            });
            emitted += self.advance_probe(&mut state, budget - emitted)?;
        }
        Ok(())
    }

    fn is_finished_locally(&self) -> bool {
        self.base.input_queue_is_empty(0)
            && self.base.input_queue_is_empty(1)
            && self.state.lock().probe.is_none()
    }

    fn close_internal(&self) {
        let mut state = self.state.lock();
        state.left.clear();
        state.right.clear();
        if let Some(probe) = state.probe.take() {
            self.base.pool().release(probe.mapping);
        }
    }

    fn current_load(&self) -> u64 {
        let state = self.state.lock();
        state
            .left
            .len()
            .saturating_mul(state.right.len())
            .saturating_add(self.base.total_input_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_derivation() {
        assert_eq!(JoinKind::Join, JoinKind::for_children(&[1, 2], &[2, 3]));
        assert_eq!(JoinKind::Cartesian, JoinKind::for_children(&[1], &[2]));
        assert_eq!(JoinKind::LeftForward, JoinKind::for_children(&[1], &[]));
        assert_eq!(JoinKind::RightForward, JoinKind::for_children(&[], &[1]));
    }

    #[test]
    fn join_and_result_variable_lists() {
        assert_eq!(vec![2], join_variables(&[1, 2], &[2, 3]));
        assert_eq!(vec![1, 2, 3], result_variables(&[1, 2], &[2, 3]));
        assert!(join_variables(&[1], &[2]).is_empty());
    }
}
