//! Weir Exec
//!
//! The execution world of the weir engine: the task capability trait and its
//! two variants (leaf algorithm task and container execution), the connection
//! executions that propagate values between tasks, the computation progress
//! observed by listeners, and rank propagation over the task graph.
//!
//! Entities in this crate are wired together by `weir-engine`, which compiles
//! a `weir-workflow` model into tasks and connections and drives them with
//! its task runner.

mod algo_task;
mod connection;
mod container;
mod error;
mod progress;
mod rank;
mod task;

pub use algo_task::{AlgoTask, ConstWork, ReducePolicy, UnitOfWork, WorkContext, WorkError, WorkInputs};
pub use connection::ConnectionExecution;
pub use container::{ContainerExecution, ContainerHook, ContainerPolicy, TaskSink};
pub use error::ExecError;
pub use progress::{
  panic_message, ComputationProgress, ComputationState, DetailedProgressListener, ProgressListener,
};
pub use rank::{propagate_ranks, RankError};
pub use task::{BranchValue, ConnectionRef, Delivery, ExecutionEntities, Task, TaskId, TaskRef};
