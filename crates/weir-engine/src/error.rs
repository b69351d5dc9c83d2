//! Engine error types.
//!
//! Compilation errors are fatal: the workflow cannot be turned into an
//! executable graph at all. Failures of individual tasks at run time are not
//! errors here; they are carried as `FinishedFailure` progress state and
//! surface in the execution report.

use thiserror::Error;
use weir_exec::RankError;
use weir_workflow::WorkflowError;

/// The workflow could not be compiled into an executable graph.
#[derive(Debug, Error)]
pub enum CompileError {
  #[error(transparent)]
  Workflow(#[from] WorkflowError),

  #[error(transparent)]
  Rank(#[from] RankError),

  /// The task factory does not know how to build a unit of work for an
  /// instance kind.
  #[error("no unit of work registered for kind '{kind}' (instance '{instance_id}')")]
  UnknownKind { instance_id: String, kind: String },
}

/// Errors of the engine surface.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error(transparent)]
  Compile(#[from] CompileError),

  /// The runner's mailbox closed while the execution was still live.
  #[error("task runner channel closed during execution")]
  RunnerClosed,
}
