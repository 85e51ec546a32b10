//! taskbot: a chat-driven task orchestrator.

pub mod builtins;
pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod pipeline;
pub mod tasks;
pub mod worker;

pub use engine::{Engine, EngineDeps};
pub use error::{Error, Result};
