//! The dispatch-and-pipeline core.
//!
//! An inbound message flows through:
//! 1. `matcher`: at most one plugin, plus any job triggers
//! 2. `security`: admin, authorization and elevation checks
//! 3. `executor`: primary, fail and final stages on a worker
//!
//! `exclusive` serializes pipelines sharing a tag, `env` builds each task's
//! environment and `history` records job runs.

pub mod env;
pub mod exclusive;
pub mod executor;
pub mod history;
pub mod matcher;
pub mod security;
pub mod types;

pub use executor::start_pipeline;
pub use types::{PipeStage, PipelineType, TaskSpec};
