//! Errors of the execution world.

use thiserror::Error;

/// Contract violations raised by execution entities.
///
/// These are programming errors on the caller's side, never per-task
/// computation failures (those are carried as `FinishedFailure` progress
/// state, which is data, not an error).
#[derive(Debug, Error)]
pub enum ExecError {
  /// The connection kind does not support externally injected values.
  #[error("connection '{connection_id}' does not support forced values")]
  ForceValueUnsupported { connection_id: String },

  /// Only finished tasks may be cleaned.
  #[error("attempted to clean unfinished child task '{task}'")]
  CleanedUnfinishedChild { task: String },
}
