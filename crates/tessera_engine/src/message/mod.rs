//! Message passing between cluster nodes.

pub mod codec;
pub mod registry;
pub mod sender;
pub mod types;

pub use registry::{MessageRouter, TaskRegistry};
pub use sender::MappingSender;
