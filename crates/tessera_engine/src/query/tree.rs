//! Execution tree wire format.
//!
//! The master serializes one tree per slave and every slave instantiates it
//! locally, so the same logical operator exists as one task instance per
//! slave. Task numbers are assigned in a deterministic pre-order walk, which
//! keeps sibling instances addressable across nodes by flipping the slave
//! half of the task id.
//!
//! Node layout: `[4B kind] [children] [8B task id] [4B emission cap]
//! [8B estimated load] [kind-specific fields]`. A slice node is not a
//! distributed operator; it serializes as its child and its bounds are
//! applied by the coordinator alone.

use std::sync::Arc;

use tessera_error::{Result, TesseraError};

use super::operators::hash_join::{self, HashJoinOperator};
pub use super::operators::hash_join::JoinKind;
use super::operators::{PatternMatchOperator, ProjectionOperator};
use super::task::{ParentInfo, QueryOperator, TaskBase, TaskParams};
use crate::collab::GraphStatistics;
use crate::config::RuntimeConfig;
use crate::executor::WorkerTask;
use crate::ident::TaskId;
use crate::mapping::{read_u32, read_u64};
use crate::message::sender::MappingSender;
use crate::store::{PatternKind, TriplePattern, TripleStore};

/// Wire discriminant of an operator node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    Projection = 0,
    TriplePatternJoin = 1,
    TriplePatternMatch = 2,
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

impl OperatorKind {
    pub fn from_wire(value: u32) -> Result<OperatorKind> {
        Ok(match value {
            0 => OperatorKind::Projection,
            1 => OperatorKind::TriplePatternJoin,
            2 => OperatorKind::TriplePatternMatch,
            other => return Err(TesseraError::new(format!("unknown operator kind: {other}"))),
        })
    }
}

/// Logical plan of a query, produced by the planner on the master.
#[derive(Debug, Clone)]
pub enum OperatorDef {
    Match {
        pattern: TriplePattern,
    },
    Join {
        kind: JoinKind,
        left: Box<OperatorDef>,
        right: Box<OperatorDef>,
    },
    Projection {
        variables: Vec<u64>,
        child: Box<OperatorDef>,
    },
    /// Offset/limit over the final result; only ever the outermost node.
    Slice {
        offset: u64,
        limit: Option<u64>,
        child: Box<OperatorDef>,
    },
}

impl OperatorDef {
    pub fn pattern_match(pattern: TriplePattern) -> OperatorDef {
        OperatorDef::Match { pattern }
    }

    /// Join two subtrees; the kind follows from the children's variables.
    pub fn join(left: OperatorDef, right: OperatorDef) -> OperatorDef {
        let kind = JoinKind::for_children(&left.result_variables(), &right.result_variables());
        OperatorDef::Join {
            kind,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn projection(variables: Vec<u64>, child: OperatorDef) -> OperatorDef {
        OperatorDef::Projection {
            variables,
            child: Box::new(child),
        }
    }

    pub fn slice(child: OperatorDef, offset: u64, limit: Option<u64>) -> OperatorDef {
        OperatorDef::Slice {
            offset,
            limit,
            child: Box::new(child),
        }
    }

    /// Variable order of the mappings this subtree produces.
    pub fn result_variables(&self) -> Vec<u64> {
        match self {
            OperatorDef::Match { pattern } => pattern.variables(),
            OperatorDef::Join { left, right, .. } => hash_join::result_variables(
                &left.result_variables(),
                &right.result_variables(),
            ),
            OperatorDef::Projection { variables, .. } => variables.clone(),
            OperatorDef::Slice { child, .. } => child.result_variables(),
        }
    }

    /// Offset and limit the coordinator applies to the collected result.
    pub fn slice_bounds(&self) -> (u64, Option<u64>) {
        match self {
            OperatorDef::Slice { offset, limit, .. } => (*offset, *limit),
            _ => (0, None),
        }
    }

    /// Serialize this tree for one slave.
    pub fn serialize_for_slave(
        &self,
        query: u32,
        slave: u16,
        coordinator: TaskId,
        emitted_per_round: usize,
        stats: &dyn GraphStatistics,
    ) -> Vec<u8> {
        let mut state = SerializeState {
            out: Vec::new(),
            query,
            slave,
            next_task: 1,
            emitted_per_round,
        };
        state.out.push(0);
        push_u64(&mut state.out, coordinator.0);
        self.write_node(&mut state, stats);
        state.out
    }

    fn write_node(&self, state: &mut SerializeState, stats: &dyn GraphStatistics) -> u64 {
        // Slices have no task instance of their own.
        if let OperatorDef::Slice { child, .. } = self {
            return child.write_node(state, stats);
        }
        let task = state.next_task;
        state.next_task += 1;
        let kind = match self {
            OperatorDef::Match { .. } => OperatorKind::TriplePatternMatch,
            OperatorDef::Join { .. } => OperatorKind::TriplePatternJoin,
            OperatorDef::Projection { .. } => OperatorKind::Projection,
            OperatorDef::Slice { .. } => unreachable!("slices serialize as their child"),
        };
        push_u32(&mut state.out, kind as u32);
        let load = match self {
            OperatorDef::Match { pattern } => {
                let load = stats.estimated_matches(pattern, state.slave);
                state.write_header(task, load);
                push_u32(&mut state.out, pattern.kind() as u32);
                push_u64(&mut state.out, pattern.subject.raw());
                push_u64(&mut state.out, pattern.property.raw());
                push_u64(&mut state.out, pattern.object.raw());
                load
            }
            OperatorDef::Join { kind, left, right } => {
                let left_load = left.write_node(state, stats);
                let right_load = right.write_node(state, stats);
                let load = left_load.saturating_mul(std::cmp::max(1, right_load));
                state.write_header(task, load);
                push_u32(&mut state.out, *kind as u32);
                load
            }
            OperatorDef::Projection { variables, child } => {
                let load = child.write_node(state, stats);
                state.write_header(task, load);
                push_u32(&mut state.out, variables.len() as u32);
                for var in variables {
                    push_u64(&mut state.out, *var);
                }
                load
            }
            OperatorDef::Slice { .. } => unreachable!("slices serialize as their child"),
        };
        load
    }
}

struct SerializeState {
    out: Vec<u8>,
    query: u32,
    slave: u16,
    next_task: u16,
    emitted_per_round: usize,
}

impl SerializeState {
    fn write_header(&mut self, task: u16, load: u64) {
        push_u64(&mut self.out, TaskId::new(self.slave, self.query, task).0);
        push_u32(&mut self.out, self.emitted_per_round as u32);
        push_u64(&mut self.out, load);
    }
}

#[derive(Debug)]
struct WireNode {
    id: TaskId,
    emitted_per_round: usize,
    estimated_load: u64,
    op: WireOp,
}

#[derive(Debug)]
enum WireOp {
    Match {
        pattern: TriplePattern,
    },
    Join {
        kind: JoinKind,
        left: Box<WireNode>,
        right: Box<WireNode>,
    },
    Projection {
        variables: Vec<u64>,
        child: Box<WireNode>,
    },
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<usize> {
        if self.pos + len > self.data.len() {
            return Err(TesseraError::new(format!(
                "tree truncated at offset {}",
                self.pos
            )));
        }
        let at = self.pos;
        self.pos += len;
        Ok(at)
    }

    fn read_u8(&mut self) -> Result<u8> {
        let at = self.take(1)?;
        Ok(self.data[at])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let at = self.take(4)?;
        Ok(read_u32(self.data, at))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let at = self.take(8)?;
        Ok(read_u64(self.data, at))
    }
}

fn parse_node(reader: &mut Reader) -> Result<WireNode> {
    let kind = OperatorKind::from_wire(reader.read_u32()?)?;
    let children = match kind {
        OperatorKind::TriplePatternMatch => Vec::new(),
        OperatorKind::Projection => vec![parse_node(reader)?],
        OperatorKind::TriplePatternJoin => vec![parse_node(reader)?, parse_node(reader)?],
    };
    let id = TaskId(reader.read_u64()?);
    let emitted_per_round = reader.read_u32()? as usize;
    let estimated_load = reader.read_u64()?;
    let mut children = children.into_iter();
    let op = match kind {
        OperatorKind::TriplePatternMatch => {
            let pattern_kind = PatternKind::from_wire(reader.read_u32()?)?;
            let s = reader.read_u64()?;
            let p = reader.read_u64()?;
            let o = reader.read_u64()?;
            WireOp::Match {
                pattern: TriplePattern::from_wire(pattern_kind, s, p, o),
            }
        }
        OperatorKind::TriplePatternJoin => {
            let join_kind = JoinKind::from_wire(reader.read_u32()?)?;
            WireOp::Join {
                kind: join_kind,
                left: Box::new(children.next().expect("two children parsed")),
                right: Box::new(children.next().expect("two children parsed")),
            }
        }
        OperatorKind::Projection => {
            let count = reader.read_u32()? as usize;
            let mut variables = Vec::with_capacity(count);
            for _ in 0..count {
                variables.push(reader.read_u64()?);
            }
            WireOp::Projection {
                variables,
                child: Box::new(children.next().expect("one child parsed")),
            }
        }
    };
    Ok(WireNode {
        id,
        emitted_per_round,
        estimated_load,
        op,
    })
}

/// A tree instantiated on this node.
#[derive(Debug)]
pub struct InstantiatedTree {
    pub coordinator: TaskId,
    /// Every task of the tree, children before their parent; the root is
    /// last.
    pub tasks: Vec<Arc<dyn WorkerTask>>,
}

impl InstantiatedTree {
    pub fn root(&self) -> &Arc<dyn WorkerTask> {
        self.tasks.last().expect("a tree has at least one task")
    }
}

/// Deserialize a tree and build its local task instances.
pub fn instantiate_tree(
    data: &[u8],
    config: &RuntimeConfig,
    sender: &Arc<MappingSender>,
    store: &Arc<TripleStore>,
) -> Result<InstantiatedTree> {
    let mut reader = Reader { data, pos: 0 };
    let encoding = reader.read_u8()?;
    if encoding != 0 {
        return Err(TesseraError::new(format!(
            "unsupported tree encoding: {encoding}"
        )));
    }
    let coordinator = TaskId(reader.read_u64()?);
    let root = parse_node(&mut reader)?;
    let mut tasks = Vec::new();
    build_node(&root, coordinator, config, sender, store, &mut tasks)?;
    Ok(InstantiatedTree { coordinator, tasks })
}

enum Built {
    Match(Arc<PatternMatchOperator>),
    Join(Arc<HashJoinOperator>),
    Projection(Arc<ProjectionOperator>),
}

impl Built {
    fn base(&self) -> &TaskBase {
        match self {
            Built::Match(op) => op.base(),
            Built::Join(op) => op.base(),
            Built::Projection(op) => op.base(),
        }
    }

    fn task(&self) -> Arc<dyn WorkerTask> {
        match self {
            Built::Match(op) => op.clone(),
            Built::Join(op) => op.clone(),
            Built::Projection(op) => op.clone(),
        }
    }
}

fn task_params(
    node: &WireNode,
    coordinator: TaskId,
    config: &RuntimeConfig,
    sender: &Arc<MappingSender>,
    children: Vec<Arc<dyn WorkerTask>>,
    input_queue_count: usize,
) -> TaskParams {
    TaskParams {
        id: node.id,
        coordinator,
        sender: sender.clone(),
        children,
        estimated_load: node.estimated_load,
        emitted_per_round: node.emitted_per_round,
        input_queue_count,
        queue_cache_size: config.receiver_queue_cache_size,
        spill_directory: config.spill_directory.clone(),
    }
}

fn build_node(
    node: &WireNode,
    coordinator: TaskId,
    config: &RuntimeConfig,
    sender: &Arc<MappingSender>,
    store: &Arc<TripleStore>,
    tasks: &mut Vec<Arc<dyn WorkerTask>>,
) -> Result<Built> {
    let built = match &node.op {
        WireOp::Match { pattern } => {
            let params = task_params(node, coordinator, config, sender, Vec::new(), 0);
            Built::Match(Arc::new(PatternMatchOperator::new(
                params,
                *pattern,
                store.clone(),
            )?))
        }
        WireOp::Join { kind, left, right } => {
            let left = build_node(left, coordinator, config, sender, store, tasks)?;
            let right = build_node(right, coordinator, config, sender, store, tasks)?;
            let left_vars = left.base_result_vars();
            let right_vars = right.base_result_vars();
            let params = task_params(
                node,
                coordinator,
                config,
                sender,
                vec![left.task(), right.task()],
                2,
            );
            let join = Arc::new(HashJoinOperator::new(
                params,
                *kind,
                left_vars.clone(),
                right_vars.clone(),
                config.join_cache_size,
                config.join_bucket_count,
            )?);
            let parent = ParentInfo {
                id: node.id,
                receives_locally: false,
                first_join_var: hash_join::join_variables(&left_vars, &right_vars)
                    .first()
                    .copied(),
            };
            left.base().set_parent(parent.clone());
            right.base().set_parent(parent);
            Built::Join(join)
        }
        WireOp::Projection { variables, child } => {
            let child = build_node(child, coordinator, config, sender, store, tasks)?;
            let child_vars = child.base_result_vars();
            let params = task_params(
                node,
                coordinator,
                config,
                sender,
                vec![child.task()],
                1,
            );
            let projection = Arc::new(ProjectionOperator::new(
                params,
                variables.clone(),
                child_vars,
            )?);
            child.base().set_parent(ParentInfo {
                id: node.id,
                receives_locally: true,
                first_join_var: None,
            });
            Built::Projection(projection)
        }
    };
    tasks.push(built.task());
    Ok(built)
}

impl Built {
    fn base_result_vars(&self) -> Vec<u64> {
        match self {
            Built::Match(op) => op.result_variables().to_vec(),
            Built::Join(op) => op.result_variables().to_vec(),
            Built::Projection(op) => op.result_variables().to_vec(),
        }
    }
}
