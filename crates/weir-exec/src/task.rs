//! The task capability trait shared by leaf and container executions.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::connection::ConnectionExecution;
use crate::container::ContainerExecution;
use crate::progress::ComputationProgress;

/// Unique identity of one execution task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for TaskId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

pub type TaskRef = Arc<dyn Task>;
pub type ConnectionRef = Arc<ConnectionExecution>;

/// How a value arrived at a consumer input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
  /// One producer firing, one consumer notification.
  Direct,
  /// One branch of a fan-out; the branch identity lets a reduce consumer
  /// distinguish which iteration a value came from. `None` when the producer
  /// has no parent to identify the branch by.
  Branch(Option<TaskId>),
}

/// A value received from one branch of a fan-out.
#[derive(Debug, Clone)]
pub struct BranchValue {
  pub branch: Option<TaskId>,
  pub value: Value,
}

/// Every task and connection reachable from a task, for monitoring UIs.
#[derive(Default)]
pub struct ExecutionEntities {
  pub tasks: Vec<TaskRef>,
  pub connections: Vec<ConnectionRef>,
}

/// The atomic unit of work.
///
/// One capability interface covers both variants: the leaf
/// [`AlgoTask`](crate::AlgoTask) and the composite
/// [`ContainerExecution`](crate::ContainerExecution). Container-specific
/// aggregation is composition behind [`as_container`](Task::as_container),
/// not inheritance depth.
#[async_trait]
pub trait Task: Send + Sync {
  fn id(&self) -> TaskId;

  fn name(&self) -> &str;

  fn progress(&self) -> &Arc<ComputationProgress>;

  /// Tasks that must reach `FinishedOk` before this one may be dispatched.
  fn prerequisites(&self) -> Vec<TaskRef>;

  fn add_prerequisite(&self, task: TaskRef);

  /// Execute the task. Runs exactly once per (reset) lifecycle and must leave
  /// the progress in a terminal state on every exit path.
  async fn run(&self);

  /// Request immediate termination regardless of in-flight state. Idempotent
  /// and safe to call from any thread; best-effort, the underlying work may
  /// not stop instantly.
  fn kill(&self);

  /// Request cooperative termination of not-yet-finished work. Already
  /// finished work is left alone; a not-yet-started task transitions straight
  /// to `FinishedCancel`.
  fn cancel(&self);

  /// A costless task may be run inline on the scheduler thread: the overhead
  /// of a worker handoff would exceed its work.
  fn is_costless(&self) -> bool {
    false
  }

  /// Maximum wall-clock duration before the runner's watchdog forces the task
  /// to `FinishedFailure`. `None` disables the watchdog (discouraged).
  fn timeout(&self) -> Option<Duration> {
    None
  }

  /// Return a finished task to a re-runnable state, clearing derived result
  /// and progress state.
  fn reset(&self);

  /// The container this task belongs to, if any.
  fn parent(&self) -> Option<TaskRef>;

  fn set_parent(&self, parent: Weak<dyn Task>);

  fn as_container(&self) -> Option<&ContainerExecution> {
    None
  }

  /// Current advisory rank (0 = unassigned).
  fn rank(&self) -> u32;

  /// Raise the rank to `rank` if that is higher; returns whether it changed.
  fn raise_rank(&self, rank: u32) -> bool;

  /// Deliver a value into an input slot. Called by connection executions when
  /// the producer side finished successfully.
  fn receive_input(&self, delivery: Delivery, slot: &str, value: Value) {
    let _ = (delivery, value);
    warn!(
      task = self.name(),
      slot, "value delivered to a task that accepts no inputs"
    );
  }

  /// Notify a reduce consumer that one branch will never deliver (it was
  /// cancelled or failed). The consumer applies its configured partial-failure
  /// policy.
  fn branch_aborted(&self, branch: Option<TaskId>, slot: &str) {
    let _ = branch;
    warn!(
      task = self.name(),
      slot, "branch abort delivered to a task that accepts no inputs"
    );
  }

  /// The published result for an output slot, available once the task
  /// finalized its outputs.
  fn result(&self, slot: &str) -> Option<Value>;

  /// Release resources held by a finished task. The owner decides when; a
  /// container folds the cleaned child's progress into its own totals first.
  fn clean(&self);

  /// Enumerate this task's transitive children and connections.
  fn collect_entities(&self, entities: &mut ExecutionEntities) {
    let _ = entities;
  }
}
