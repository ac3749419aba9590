//! Concrete execution tree operators.

pub mod hash_join;
pub mod pattern_match;
pub mod projection;
pub mod spill_set;

pub use hash_join::HashJoinOperator;
pub use pattern_match::PatternMatchOperator;
pub use projection::ProjectionOperator;
pub use spill_set::MappingSpillSet;
