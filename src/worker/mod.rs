//! Per-pipeline state and the services tasks use while they run.
//!
//! - `state`: the worker: one running pipeline's context
//! - `robot`: the capability object handed to tasks
//! - `memory`: short-term context memories
//! - `replies`: reply waiters for prompts

pub mod memory;
pub mod replies;
pub mod robot;
pub mod state;

pub use memory::ShortTermMemory;
pub use replies::ReplyRegistry;
pub use robot::Robot;
pub use state::{PipeState, Worker};
