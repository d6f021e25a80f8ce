//! Fan-out command execution.
//!
//! This module provides:
//! - Partitioning of node sets into batches
//! - The remote-execution collaborator and its for-array implementation
//! - Demultiplexing of the combined output into per-node text

pub mod batch;
pub mod demux;
pub mod executor;

pub use batch::NodeTarget;
pub use demux::Demultiplexer;
pub use executor::{DispatchResult, FanoutExecutor, ForArrayExecutor, RemoteExecutor};
