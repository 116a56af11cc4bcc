//! Task abstractions
//!
//! Tasks are units of work executed by workers outside workflow logic. They:
//! - May fail and be retried with backoff up to their retry bound
//! - Extend their lease through heartbeats
//! - Observe cancellation of their owning workflow cooperatively

mod context;
mod definition;

pub use context::{HeartbeatError, HeartbeatPayload, TaskContext};
pub use definition::{Task, TaskError, TaskHandler, TaskRegistry, TypedTask};
