//! The leaf task variant: one algorithm instance wrapped as a unit of work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use weir_workflow::AlgoInstance;

use crate::progress::{ComputationProgress, ComputationState};
use crate::task::{BranchValue, Delivery, Task, TaskId, TaskRef};

/// How a reduce consumer treats branches that will never deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReducePolicy {
  /// One failed or cancelled branch cancels the whole consumer.
  #[default]
  Strict,
  /// Aborted branches are recorded and the consumer aggregates the surviving
  /// branch values.
  Partial,
}

/// Everything a unit of work may fail with.
///
/// Both variants become `FinishedFailure` on the task; `InvalidInput` is
/// additionally reported on the user-facing channel, it is the user's
/// configuration that is wrong, not the engine.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
  #[error("invalid input: {0}")]
  InvalidInput(String),

  #[error("{0}")]
  Failed(String),
}

/// Snapshot of the values available to one execution of a unit of work.
#[derive(Debug, Clone, Default)]
pub struct WorkInputs {
  /// Directly connected inputs, by slot.
  pub inputs: HashMap<String, Value>,
  /// Values collected across fan-out branches, by slot, tagged with the
  /// originating branch.
  pub reduced: HashMap<String, Vec<BranchValue>>,
  /// Branches that aborted (cancelled or failed) per slot, visible to reduce
  /// consumers running under [`ReducePolicy::Partial`].
  pub aborted_branches: HashMap<String, u64>,
  /// Resolved parameter values of the algorithm instance.
  pub params: HashMap<String, Value>,
}

/// Context handed to a unit of work for one execution.
pub struct WorkContext {
  pub inputs: WorkInputs,
  /// The owning task's progress; the work may report done/total counters.
  pub progress: Arc<ComputationProgress>,
  /// Cooperative cancellation; the work should stop at its own safe points.
  pub cancel: CancellationToken,
}

/// The pluggable algorithm body. The engine never depends on what the work
/// computes, only on this contract: compute once, return the outputs by slot.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
  async fn compute(&self, ctx: WorkContext) -> Result<HashMap<String, Value>, WorkError>;
}

/// A unit of work that publishes fixed outputs, optionally after a delay.
/// Useful for bookkeeping tasks and tests.
pub struct ConstWork {
  outputs: HashMap<String, Value>,
  delay: Option<Duration>,
}

impl ConstWork {
  pub fn new(outputs: HashMap<String, Value>) -> Self {
    Self {
      outputs,
      delay: None,
    }
  }

  pub fn single(slot: impl Into<String>, value: Value) -> Self {
    Self::new(HashMap::from([(slot.into(), value)]))
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }
}

#[async_trait]
impl UnitOfWork for ConstWork {
  async fn compute(&self, _ctx: WorkContext) -> Result<HashMap<String, Value>, WorkError> {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    Ok(self.outputs.clone())
  }
}

struct AlgoTaskState {
  inputs: HashMap<String, Value>,
  reduced: HashMap<String, Vec<BranchValue>>,
  aborted_branches: HashMap<String, u64>,
  outputs: Option<HashMap<String, Value>>,
  cancel: CancellationToken,
}

/// The leaf task: wraps one algorithm instance (or none, for infrastructure
/// tasks), buffers the inputs delivered by connections, runs the unit of work
/// once, and publishes its outputs for downstream connections to read.
pub struct AlgoTask {
  id: TaskId,
  name: String,
  instance: Option<Arc<AlgoInstance>>,
  progress: Arc<ComputationProgress>,
  work: Arc<dyn UnitOfWork>,
  timeout: Option<Duration>,
  costless: bool,
  reduce_policy: ReducePolicy,
  rank: AtomicU32,
  ran: AtomicBool,
  parent: Mutex<Option<Weak<dyn Task>>>,
  prerequisites: Mutex<Vec<TaskRef>>,
  state: Mutex<AlgoTaskState>,
}

impl AlgoTask {
  pub fn new(name: impl Into<String>, work: Arc<dyn UnitOfWork>) -> Self {
    let id = TaskId::new();
    let name = name.into();
    Self {
      id,
      progress: ComputationProgress::new(id, name.clone()),
      name,
      instance: None,
      work,
      timeout: None,
      costless: false,
      reduce_policy: ReducePolicy::default(),
      rank: AtomicU32::new(0),
      ran: AtomicBool::new(false),
      parent: Mutex::new(None),
      prerequisites: Mutex::new(Vec::new()),
      state: Mutex::new(AlgoTaskState {
        inputs: HashMap::new(),
        reduced: HashMap::new(),
        aborted_branches: HashMap::new(),
        outputs: None,
        cancel: CancellationToken::new(),
      }),
    }
  }

  /// Create a task for a workflow instance; name and timeout come from the
  /// instance.
  pub fn for_instance(instance: Arc<AlgoInstance>, work: Arc<dyn UnitOfWork>) -> Self {
    let mut task = Self::new(instance.name.clone(), work);
    task.timeout = instance.timeout_ms.map(Duration::from_millis);
    task.instance = Some(instance);
    task
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_costless(mut self) -> Self {
    self.costless = true;
    self
  }

  pub fn with_reduce_policy(mut self, policy: ReducePolicy) -> Self {
    self.reduce_policy = policy;
    self
  }

  pub fn instance(&self) -> Option<&Arc<AlgoInstance>> {
    self.instance.as_ref()
  }

  fn snapshot_inputs(&self) -> WorkInputs {
    let state = self.state.lock();
    WorkInputs {
      inputs: state.inputs.clone(),
      reduced: state.reduced.clone(),
      aborted_branches: state.aborted_branches.clone(),
      params: self
        .instance
        .as_ref()
        .map(|i| i.params.clone())
        .unwrap_or_default(),
    }
  }
}

#[async_trait]
impl Task for AlgoTask {
  fn id(&self) -> TaskId {
    self.id
  }

  fn name(&self) -> &str {
    &self.name
  }

  fn progress(&self) -> &Arc<ComputationProgress> {
    &self.progress
  }

  fn prerequisites(&self) -> Vec<TaskRef> {
    self.prerequisites.lock().clone()
  }

  fn add_prerequisite(&self, task: TaskRef) {
    let mut prerequisites = self.prerequisites.lock();
    if !prerequisites.iter().any(|t| t.id() == task.id()) {
      prerequisites.push(task);
    }
  }

  #[instrument(name = "task_run", skip(self), fields(task_id = %self.id, task = %self.name))]
  async fn run(&self) {
    if self.ran.swap(true, Ordering::SeqCst) {
      warn!("task was already run; ignoring");
      return;
    }
    if self.progress.is_finished() {
      // Cancelled before dispatch.
      return;
    }

    let cancel = self.state.lock().cancel.clone();
    if cancel.is_cancelled() {
      self.progress.set_state(ComputationState::FinishedCancel);
      return;
    }

    self.progress.set_state(ComputationState::Started);
    info!("task started");

    let ctx = WorkContext {
      inputs: self.snapshot_inputs(),
      progress: self.progress.clone(),
      cancel: cancel.clone(),
    };

    let outcome = tokio::select! {
      _ = cancel.cancelled() => None,
      result = self.work.compute(ctx) => Some(result),
    };

    match outcome {
      None => {
        info!("task cancelled");
        self.progress.set_state(ComputationState::FinishedCancel);
      }
      Some(Ok(outputs)) => {
        // Publish before the terminal transition so connection listeners can
        // read the result the moment they observe FinishedOk.
        self.state.lock().outputs = Some(outputs);
        info!("task completed");
        self.progress.set_state(ComputationState::FinishedOk);
      }
      Some(Err(WorkError::InvalidInput(message))) => {
        warn!(error = %message, "task rejected its input");
        self.progress.record_failure(message);
      }
      Some(Err(WorkError::Failed(message))) => {
        error!(error = %message, "task failed");
        self.progress.record_failure(message);
      }
    }
  }

  fn kill(&self) {
    self.state.lock().cancel.cancel();
    if self.progress.state() == ComputationState::Created {
      self.progress.set_state(ComputationState::FinishedCancel);
    }
  }

  fn cancel(&self) {
    if self.progress.is_finished() {
      return;
    }
    self.state.lock().cancel.cancel();
    if self.progress.state() == ComputationState::Created {
      self.progress.set_state(ComputationState::FinishedCancel);
    }
  }

  fn is_costless(&self) -> bool {
    self.costless
  }

  fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  fn reset(&self) {
    let mut state = self.state.lock();
    state.inputs.clear();
    state.reduced.clear();
    state.aborted_branches.clear();
    state.outputs = None;
    state.cancel = CancellationToken::new();
    drop(state);
    self.ran.store(false, Ordering::SeqCst);
    self.progress.reset();
  }

  fn parent(&self) -> Option<TaskRef> {
    self.parent.lock().as_ref().and_then(|w| w.upgrade())
  }

  fn set_parent(&self, parent: Weak<dyn Task>) {
    *self.parent.lock() = Some(parent);
  }

  fn rank(&self) -> u32 {
    self.rank.load(Ordering::SeqCst)
  }

  fn raise_rank(&self, rank: u32) -> bool {
    self.rank.fetch_max(rank, Ordering::SeqCst) < rank
  }

  fn receive_input(&self, delivery: Delivery, slot: &str, value: Value) {
    let mut state = self.state.lock();
    match delivery {
      Delivery::Direct => {
        state.inputs.insert(slot.to_string(), value);
      }
      Delivery::Branch(branch) => {
        state
          .reduced
          .entry(slot.to_string())
          .or_default()
          .push(BranchValue { branch, value });
      }
    }
  }

  fn branch_aborted(&self, branch: Option<TaskId>, slot: &str) {
    match self.reduce_policy {
      ReducePolicy::Strict => {
        info!(
          task = %self.name,
          slot,
          "branch aborted; strict reduce policy cancels the consumer"
        );
        self.cancel();
      }
      ReducePolicy::Partial => {
        let mut state = self.state.lock();
        *state.aborted_branches.entry(slot.to_string()).or_default() += 1;
        drop(state);
        info!(
          task = %self.name,
          slot,
          branch = ?branch,
          "branch aborted; partial reduce policy keeps the surviving branches"
        );
      }
    }
  }

  fn result(&self, slot: &str) -> Option<Value> {
    self
      .state
      .lock()
      .outputs
      .as_ref()
      .and_then(|outputs| outputs.get(slot).cloned())
  }

  fn clean(&self) {
    let mut state = self.state.lock();
    state.inputs.clear();
    state.reduced.clear();
    state.outputs = None;
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  struct FailingWork;

  #[async_trait]
  impl UnitOfWork for FailingWork {
    async fn compute(&self, _ctx: WorkContext) -> Result<HashMap<String, Value>, WorkError> {
      Err(WorkError::Failed("boom".to_string()))
    }
  }

  fn const_task(name: &str) -> AlgoTask {
    AlgoTask::new(name, Arc::new(ConstWork::single("out", json!(42))))
  }

  #[tokio::test]
  async fn run_publishes_outputs_then_finishes_ok() {
    let task = const_task("t");
    task.run().await;

    assert_eq!(task.progress().state(), ComputationState::FinishedOk);
    assert_eq!(task.result("out"), Some(json!(42)));
    assert_eq!(task.result("missing"), None);
  }

  #[tokio::test]
  async fn run_is_one_shot() {
    let task = const_task("t");
    task.run().await;
    task.clean();
    task.run().await;

    // Second run is ignored; outputs stay cleaned.
    assert_eq!(task.result("out"), None);
  }

  #[tokio::test]
  async fn failure_records_message() {
    let task = AlgoTask::new("t", Arc::new(FailingWork));
    task.run().await;

    assert_eq!(task.progress().state(), ComputationState::FinishedFailure);
    assert_eq!(task.progress().failure().as_deref(), Some("boom"));
  }

  #[tokio::test]
  async fn cancel_before_start_is_terminal() {
    let task = const_task("t");
    task.cancel();

    assert_eq!(task.progress().state(), ComputationState::FinishedCancel);

    // Running afterwards does not resurrect it.
    task.run().await;
    assert_eq!(task.progress().state(), ComputationState::FinishedCancel);
  }

  #[tokio::test]
  async fn cancel_leaves_finished_work_alone() {
    let task = const_task("t");
    task.run().await;
    task.cancel();

    assert_eq!(task.progress().state(), ComputationState::FinishedOk);
  }

  #[tokio::test]
  async fn running_task_observes_cancellation() {
    let work = ConstWork::single("out", json!(1)).with_delay(Duration::from_secs(30));
    let task = Arc::new(AlgoTask::new("slow", Arc::new(work)));

    let run = {
      let task = task.clone();
      tokio::spawn(async move { task.run().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    task.cancel();
    run.await.unwrap();

    assert_eq!(task.progress().state(), ComputationState::FinishedCancel);
  }

  #[tokio::test]
  async fn strict_reduce_policy_cancels_on_branch_abort() {
    let task = const_task("reduce");
    task.branch_aborted(Some(TaskId::new()), "collected");

    assert_eq!(task.progress().state(), ComputationState::FinishedCancel);
  }

  #[tokio::test]
  async fn partial_reduce_policy_keeps_surviving_branches() {
    let task = const_task("reduce").with_reduce_policy(ReducePolicy::Partial);
    let branch = TaskId::new();
    task.receive_input(Delivery::Branch(Some(branch)), "collected", json!(7));
    task.branch_aborted(Some(TaskId::new()), "collected");

    let inputs = task.snapshot_inputs();
    assert_eq!(inputs.reduced["collected"].len(), 1);
    assert_eq!(inputs.aborted_branches["collected"], 1);
    assert!(!task.progress().is_finished());
  }

  #[tokio::test]
  async fn reset_makes_the_task_runnable_again() {
    let task = const_task("t");
    task.run().await;
    assert_eq!(task.progress().state(), ComputationState::FinishedOk);

    task.reset();
    assert_eq!(task.progress().state(), ComputationState::Created);
    assert_eq!(task.result("out"), None);

    task.run().await;
    assert_eq!(task.progress().state(), ComputationState::FinishedOk);
    assert_eq!(task.result("out"), Some(json!(42)));
  }

  #[test]
  fn prerequisites_deduplicate() {
    let task = const_task("t");
    let other: TaskRef = Arc::new(const_task("other"));
    task.add_prerequisite(other.clone());
    task.add_prerequisite(other);

    assert_eq!(task.prerequisites().len(), 1);
  }
}
