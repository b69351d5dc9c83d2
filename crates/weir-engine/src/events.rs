//! Execution events for observers.
//!
//! Events are emitted as tasks move through their lifecycle so consumers can
//! persist state, stream to UIs or feed dashboards without hooking into the
//! progress listeners themselves.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use weir_exec::ComputationState;

/// Events emitted while an execution is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// The execution has started.
  ExecutionStarted {
    execution_id: String,
    workflow_id: String,
  },

  /// A task became part of the execution graph, either at registration or
  /// discovered mid-run inside a running container.
  TaskAdded { execution_id: String, task: String },

  /// A finished task was cleaned out of the graph and released its resources.
  TaskRemoved { execution_id: String, task: String },

  /// A task began running.
  TaskStarted { execution_id: String, task: String },

  /// A task reached a terminal state.
  TaskFinished {
    execution_id: String,
    task: String,
    state: ComputationState,
    /// The recorded failure message for `FinishedFailure`.
    error: Option<String>,
  },

  /// The whole execution reached a terminal state.
  ExecutionFinished {
    execution_id: String,
    state: ComputationState,
  },
}

/// Receives execution events.
///
/// The engine calls `notify` for every event; implementations decide what to
/// do with them (persist, broadcast, log, ignore).
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

/// Discards all events. The default when observation is not needed.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// Forwards events into an unbounded channel for asynchronous consumption.
///
/// Unbounded so a slow consumer never stalls the scheduler; the event volume
/// is a handful per task, so growth is bounded by the graph size in practice.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // The receiver may be gone; events are advisory.
    let _ = self.sender.send(event);
  }
}
