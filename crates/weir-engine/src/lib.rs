//! Workflow compilation and scheduling engine.
//!
//! Compiles a `weir-workflow` model into a graph of `weir-exec` entities and
//! drives it with a bounded worker pool.

mod engine;
mod error;
mod events;
mod runner;

pub use engine::{Engine, Execution, ExecutionReport, KindRegistry, TaskFactory, TaskReport};
pub use error::{CompileError, EngineError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use runner::{RunnerConfig, TaskRunner};
