//! Distributed execution runtime for graph pattern queries.
//!
//! A query is planned on the master as a tree of operators, serialized, and
//! instantiated identically on every slave. Pattern matches stream out of
//! each slave's local triple index, joins exchange intermediate mappings
//! over a batched binary protocol, and a broadcast-then-wait barrier per
//! tree node detects distributed completion. The master-side coordinator
//! collects the final mappings, applies slice bounds, and streams decoded
//! rows to the client.

pub mod collab;
pub mod config;
pub mod executor;
pub mod ident;
pub mod mapping;
pub mod message;
pub mod query;
pub mod store;
pub mod testutil;
