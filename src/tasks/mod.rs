//! Tasks: the model, the registry, return values and invocation.

pub mod invoker;
pub mod model;
pub mod registry;
pub mod retval;

pub use invoker::{DefaultInvoker, TaskHandler, TaskInvoker, handler_fn};
pub use model::{InputMatcher, Job, JobTrigger, Plugin, ReplyMatcher, Task, TaskKind};
pub use registry::TaskRegistry;
pub use retval::{RetVal, TaskRetVal};
