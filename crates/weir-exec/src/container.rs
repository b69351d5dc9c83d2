//! The composite task variant: a container aggregating child tasks.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use weir_workflow::AlgoInstance;

use crate::progress::{
  panic_message, ComputationProgress, ComputationState, DetailedProgressListener, ProgressListener,
};
use crate::error::ExecError;
use crate::task::{ConnectionRef, ExecutionEntities, Task, TaskId, TaskRef};

/// How a container folds child outcomes into its own state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerPolicy {
  /// Ignore children that finished with a failure (best-effort sub-graphs).
  pub ignore_child_failures: bool,
  /// Ignore children that finished cancelled.
  pub ignore_child_cancel: bool,
}

/// Invoked once all children finished, before the container's own terminal
/// transition, so the hook can still read full child state. Container kinds
/// use this to transmit aggregated results (publish outputs on the
/// container).
pub trait ContainerHook: Send + Sync {
  fn container_finished(&self, container: &ContainerExecution, state: ComputationState);
}

/// Where a container submits children discovered while it is already running,
/// so they become eligible for scheduling immediately. Implemented by the
/// runner's handle.
pub trait TaskSink: Send + Sync {
  fn submit(&self, task: TaskRef);

  /// A finished task left the graph (see
  /// [`clean_child`](ContainerExecution::clean_child)).
  fn withdraw(&self, _task: TaskRef) {}
}

/// A composite task holding a mutable set of child tasks.
///
/// The container listens to every child's progress and rolls child states up
/// into its own state once all children finished; kill and cancel are
/// forwarded down to the children. Its own state is `FinishedOk` only if
/// every non-ignored child reported `FinishedOk`; a failed child makes it
/// `FinishedFailure`; a cancelled child (and no failure) makes it
/// `FinishedCancel`, subject to the configured policy.
pub struct ContainerExecution {
  id: TaskId,
  name: String,
  instance: Mutex<Option<Arc<AlgoInstance>>>,
  progress: Arc<ComputationProgress>,
  policy: ContainerPolicy,
  rank: AtomicU32,
  ran: AtomicBool,
  parent: Mutex<Option<Weak<dyn Task>>>,
  prerequisites: Mutex<Vec<TaskRef>>,
  children: Mutex<Vec<TaskRef>>,
  connections: Mutex<Vec<ConnectionRef>>,
  outputs: Mutex<HashMap<String, Value>>,
  /// Progress contributed by children removed via [`clean_child`]; their
  /// share must still count so aggregate progress never regresses.
  removed_done: AtomicU64,
  removed_count: AtomicU64,
  something_failed: AtomicBool,
  something_cancelled: AtomicBool,
  /// Set before kill/cancel forwarding snapshots the children; a child
  /// admitted after the snapshot forwards to itself in `add_child`.
  kill_requested: AtomicBool,
  cancel_requested: AtomicBool,
  /// Set once the terminal classification begins; no new children after this.
  /// Both the set and the check in `add_child` happen under the children
  /// lock.
  finishing: AtomicBool,
  hook: Mutex<Option<Arc<dyn ContainerHook>>>,
  sink: Mutex<Option<Arc<dyn TaskSink>>>,
  self_weak: Weak<ContainerExecution>,
}

impl ContainerExecution {
  pub fn new(name: impl Into<String>) -> Arc<Self> {
    Self::with_policy(name, ContainerPolicy::default())
  }

  pub fn with_policy(name: impl Into<String>, policy: ContainerPolicy) -> Arc<Self> {
    let id = TaskId::new();
    let name = name.into();
    Arc::new_cyclic(|weak| Self {
      id,
      progress: ComputationProgress::new(id, name.clone()),
      name,
      instance: Mutex::new(None),
      policy,
      rank: AtomicU32::new(0),
      ran: AtomicBool::new(false),
      parent: Mutex::new(None),
      prerequisites: Mutex::new(Vec::new()),
      children: Mutex::new(Vec::new()),
      connections: Mutex::new(Vec::new()),
      outputs: Mutex::new(HashMap::new()),
      removed_done: AtomicU64::new(0),
      removed_count: AtomicU64::new(0),
      something_failed: AtomicBool::new(false),
      something_cancelled: AtomicBool::new(false),
      kill_requested: AtomicBool::new(false),
      cancel_requested: AtomicBool::new(false),
      finishing: AtomicBool::new(false),
      hook: Mutex::new(None),
      sink: Mutex::new(None),
      self_weak: weak.clone(),
    })
  }

  /// Create a container for a workflow instance.
  pub fn for_instance(instance: Arc<AlgoInstance>, policy: ContainerPolicy) -> Arc<Self> {
    let container = Self::with_policy(instance.name.clone(), policy);
    *container.instance.lock() = Some(instance);
    container
  }

  pub fn instance(&self) -> Option<Arc<AlgoInstance>> {
    self.instance.lock().clone()
  }

  /// Install the finished hook. Must happen before children start finishing.
  pub fn set_hook(&self, hook: Arc<dyn ContainerHook>) {
    *self.hook.lock() = Some(hook);
  }

  /// Attach the scheduler sink so children added while running are submitted
  /// immediately. The runner calls this when it registers the container.
  pub fn attach_sink(&self, sink: Arc<dyn TaskSink>) {
    *self.sink.lock() = Some(sink);
  }

  /// Add a child task. Rejected (returns `false`) once the container started
  /// finishing.
  pub fn add_child(&self, child: TaskRef) -> bool {
    {
      // The finishing decision is taken under this same lock, so a child
      // admitted here is guaranteed to be part of the closing pass.
      let mut children = self.children.lock();
      if self.finishing.load(Ordering::Acquire) || self.progress.is_finished() {
        warn!(
          container = %self.name,
          child = child.name(),
          "rejected child: container is already finishing"
        );
        return false;
      }
      if children.iter().any(|t| t.id() == child.id()) {
        return false;
      }
      children.push(child.clone());
    }

    let parent: Weak<dyn Task> = self.self_weak.clone();
    child.set_parent(parent);
    let listener: Weak<dyn ProgressListener> = self.self_weak.clone();
    child.progress().add_listener(listener);
    let detailed: Weak<dyn DetailedProgressListener> = self.self_weak.clone();
    child.progress().add_detailed_listener(detailed);

    // A kill or cancel that raced with this admission took its snapshot
    // without us; forward to the new child here. Both sides may forward, the
    // calls are idempotent.
    if self.kill_requested.load(Ordering::Acquire) {
      child.kill();
    } else if self.cancel_requested.load(Ordering::Acquire) {
      child.cancel();
    }

    // Children discovered while we are already scheduled must become known to
    // the runner immediately; before that, the runner discovers them itself
    // when we are registered.
    if let Some(sink) = self.sink.lock().clone() {
      sink.submit(child.clone());
    }

    debug!(container = %self.name, child = child.name(), "child added");
    true
  }

  /// Track a connection belonging to this container's sub-graph.
  pub fn add_connection(&self, connection: ConnectionRef) {
    self.connections.lock().push(connection);
  }

  /// Snapshot of the current children.
  pub fn children(&self) -> Vec<TaskRef> {
    self.children.lock().clone()
  }

  /// Publish an aggregated output, typically from the finished hook.
  pub fn publish(&self, slot: impl Into<String>, value: Value) {
    self.outputs.lock().insert(slot.into(), value);
  }

  /// Remove a finished child, folding its progress contribution into the
  /// container's carried totals first so aggregate progress stays monotonic.
  pub fn clean_child(&self, child: &TaskRef) -> Result<(), ExecError> {
    match child.progress().state() {
      ComputationState::FinishedOk => {}
      ComputationState::FinishedCancel => {
        self.something_cancelled.store(true, Ordering::Release);
      }
      ComputationState::FinishedFailure => {
        self.something_failed.store(true, Ordering::Release);
      }
      _ => {
        return Err(ExecError::CleanedUnfinishedChild {
          task: child.name().to_string(),
        });
      }
    }

    self.removed_count.fetch_add(1, Ordering::AcqRel);
    self
      .removed_done
      .fetch_add(child.progress().done(), Ordering::AcqRel);
    self.children.lock().retain(|t| t.id() != child.id());
    child.clean();
    if let Some(sink) = self.sink.lock().clone() {
      sink.withdraw(child.clone());
    }
    debug!(container = %self.name, child = child.name(), "child cleaned");
    Ok(())
  }

  /// Recompute aggregate progress from the children; transition to a terminal
  /// state once every child finished. Runs on every child state or progress
  /// change, on whichever thread delivered the notification.
  fn update_from_children(&self) {
    if self.finishing.load(Ordering::Acquire) {
      return;
    }

    // The snapshot and the finishing decision share the children lock with
    // `add_child`: a concurrently admitted child is either in this snapshot
    // or arrives after `finishing` is set and gets rejected. The lock is
    // released before any progress listener runs.
    let (children, closing) = {
      let guard = self.children.lock();
      let children: Vec<TaskRef> = guard.clone();
      let all_finished = children.iter().all(|c| c.progress().is_finished());
      let closing = all_finished
        && self
          .finishing
          .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
          .is_ok();
      (children, closing)
    };

    // One carried unit per removed child for its own completion, plus its
    // done-count, on both sides.
    let carried = self.removed_done.load(Ordering::Acquire) + self.removed_count.load(Ordering::Acquire);
    let mut total = carried;
    let mut done = carried;

    for child in &children {
      let progress = child.progress();
      let state = progress.state();
      total += progress.total() + 1;
      if !state.is_finished() {
        done += progress.done();
        continue;
      }
      done += progress.done() + 1;
      match state {
        ComputationState::FinishedFailure => {
          self.something_failed.store(true, Ordering::Release);
        }
        ComputationState::FinishedCancel => {
          self.something_cancelled.store(true, Ordering::Release);
        }
        ComputationState::FinishedOk => {}
        _ => unreachable!("state was checked to be finished"),
      }
    }

    self.progress.set_total(total);
    self.progress.set_done(done);

    if !closing {
      return;
    }

    let failed = self.something_failed.load(Ordering::Acquire);
    let cancelled = self.something_cancelled.load(Ordering::Acquire);
    let state = if failed && !self.policy.ignore_child_failures {
      ComputationState::FinishedFailure
    } else if cancelled && !self.policy.ignore_child_cancel {
      ComputationState::FinishedCancel
    } else {
      ComputationState::FinishedOk
    };

    info!(
      container = %self.name,
      state = ?state,
      children = children.len(),
      "all children finished; closing container"
    );

    // The hook observes full child state: it runs before our own terminal
    // transition.
    if let Some(hook) = self.hook.lock().clone() {
      let result = catch_unwind(AssertUnwindSafe(|| hook.container_finished(self, state)));
      if let Err(payload) = result {
        error!(
          container = %self.name,
          panic = %panic_message(payload.as_ref()),
          "container finished hook panicked"
        );
      }
    }

    if self.progress.state() == ComputationState::Created {
      // Children can all finish before our own run was dispatched.
      self.progress.set_state(ComputationState::Started);
    }
    self.progress.set_state(state);
  }
}

#[async_trait]
impl Task for ContainerExecution {
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

  #[instrument(name = "container_run", skip(self), fields(task_id = %self.id, container = %self.name))]
  async fn run(&self) {
    if self.ran.swap(true, Ordering::SeqCst) {
      warn!("container was already run; ignoring");
      return;
    }
    if self.progress.is_finished() {
      return;
    }
    self.progress.set_state(ComputationState::Started);
    info!("container started");

    // Children run as tasks of their own; aggregation drives us to a terminal
    // state. Catch up on children that already finished (or an empty child
    // set, which closes immediately).
    self.update_from_children();
  }

  fn kill(&self) {
    self.kill_requested.store(true, Ordering::Release);
    for child in self.children() {
      let result = catch_unwind(AssertUnwindSafe(|| child.kill()));
      if let Err(payload) = result {
        warn!(
          container = %self.name,
          child = child.name(),
          panic = %panic_message(payload.as_ref()),
          "child panicked on kill"
        );
      }
    }
  }

  fn cancel(&self) {
    self.cancel_requested.store(true, Ordering::Release);
    for child in self.children() {
      if child.progress().is_finished() {
        continue;
      }
      let result = catch_unwind(AssertUnwindSafe(|| child.cancel()));
      if let Err(payload) = result {
        warn!(
          container = %self.name,
          child = child.name(),
          panic = %panic_message(payload.as_ref()),
          "child panicked on cancel"
        );
      }
    }
  }

  fn is_costless(&self) -> bool {
    // The container's own work is bookkeeping; a worker handoff would cost
    // more than the aggregation it triggers.
    true
  }

  fn timeout(&self) -> Option<Duration> {
    // Children may have timeouts; the container itself does not.
    None
  }

  fn reset(&self) {
    for child in self.children() {
      child.reset();
    }
    self.removed_done.store(0, Ordering::Release);
    self.removed_count.store(0, Ordering::Release);
    self.something_failed.store(false, Ordering::Release);
    self.something_cancelled.store(false, Ordering::Release);
    self.kill_requested.store(false, Ordering::Release);
    self.cancel_requested.store(false, Ordering::Release);
    self.finishing.store(false, Ordering::Release);
    self.outputs.lock().clear();
    self.ran.store(false, Ordering::SeqCst);
    self.progress.reset();
  }

  fn parent(&self) -> Option<TaskRef> {
    self.parent.lock().as_ref().and_then(|w| w.upgrade())
  }

  fn set_parent(&self, parent: Weak<dyn Task>) {
    *self.parent.lock() = Some(parent);
  }

  fn as_container(&self) -> Option<&ContainerExecution> {
    Some(self)
  }

  fn rank(&self) -> u32 {
    self.rank.load(Ordering::SeqCst)
  }

  fn raise_rank(&self, rank: u32) -> bool {
    self.rank.fetch_max(rank, Ordering::SeqCst) < rank
  }

  fn result(&self, slot: &str) -> Option<Value> {
    self.outputs.lock().get(slot).cloned()
  }

  fn clean(&self) {
    for child in self.children() {
      child.clean();
    }
    self.children.lock().clear();
    self.connections.lock().clear();
    self.outputs.lock().clear();
  }

  fn collect_entities(&self, entities: &mut ExecutionEntities) {
    for connection in self.connections.lock().iter() {
      entities.connections.push(connection.clone());
    }
    for child in self.children() {
      entities.tasks.push(child.clone());
      child.collect_entities(entities);
    }
  }
}

impl ProgressListener for ContainerExecution {
  fn computation_state_changed(&self, progress: &ComputationProgress) {
    // Intermediate states are uninteresting; aggregation runs on completion.
    if !progress.state().is_finished() {
      return;
    }
    // Ignore progress that is not coming from one of my children.
    let is_child = self
      .children
      .lock()
      .iter()
      .any(|t| t.id() == progress.task_id());
    if !is_child {
      return;
    }
    self.update_from_children();
  }
}

impl DetailedProgressListener for ContainerExecution {
  fn computation_progress_changed(&self, progress: &ComputationProgress) {
    let is_child = self
      .children
      .lock()
      .iter()
      .any(|t| t.id() == progress.task_id());
    if !is_child {
      return;
    }
    self.update_from_children();
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::algo_task::{AlgoTask, ConstWork};

  fn child(name: &str) -> TaskRef {
    Arc::new(AlgoTask::new(
      name,
      Arc::new(ConstWork::single("out", json!(1))),
    ))
  }

  #[tokio::test]
  async fn empty_container_finishes_ok() {
    let container = ContainerExecution::new("empty");
    container.run().await;
    assert_eq!(container.progress().state(), ComputationState::FinishedOk);
  }

  #[tokio::test]
  async fn all_children_ok_finishes_ok() {
    let container = ContainerExecution::new("c");
    let a = child("a");
    let b = child("b");
    assert!(container.add_child(a.clone()));
    assert!(container.add_child(b.clone()));

    container.run().await;
    assert!(!container.progress().is_finished());

    a.run().await;
    assert!(!container.progress().is_finished());
    b.run().await;

    assert_eq!(container.progress().state(), ComputationState::FinishedOk);
    // One progress unit per finished child.
    assert_eq!(container.progress().done(), 2);
    assert_eq!(container.progress().total(), 2);
  }

  #[tokio::test]
  async fn one_failed_child_fails_the_container() {
    let container = ContainerExecution::new("c");
    let a = child("a");
    let b = child("b");
    container.add_child(a.clone());
    container.add_child(b.clone());
    container.run().await;

    a.run().await;
    b.progress().record_failure("boom");

    assert_eq!(
      container.progress().state(),
      ComputationState::FinishedFailure
    );
  }

  #[tokio::test]
  async fn ignore_failures_policy_still_finishes_ok() {
    let container = ContainerExecution::with_policy(
      "c",
      ContainerPolicy {
        ignore_child_failures: true,
        ignore_child_cancel: false,
      },
    );
    let a = child("a");
    container.add_child(a.clone());
    container.run().await;

    a.progress().record_failure("boom");

    assert_eq!(container.progress().state(), ComputationState::FinishedOk);
  }

  #[tokio::test]
  async fn cancelled_child_cancels_the_container() {
    let container = ContainerExecution::new("c");
    let a = child("a");
    container.add_child(a.clone());
    container.run().await;

    a.cancel();

    assert_eq!(
      container.progress().state(),
      ComputationState::FinishedCancel
    );
  }

  #[tokio::test]
  async fn failure_wins_over_cancel() {
    let container = ContainerExecution::new("c");
    let a = child("a");
    let b = child("b");
    container.add_child(a.clone());
    container.add_child(b.clone());
    container.run().await;

    a.cancel();
    b.progress().record_failure("boom");

    assert_eq!(
      container.progress().state(),
      ComputationState::FinishedFailure
    );
  }

  #[tokio::test]
  async fn cleaning_children_keeps_progress_monotonic() {
    let container = ContainerExecution::new("c");
    let children: Vec<TaskRef> = (0..5).map(|i| child(&format!("t{i}"))).collect();
    for c in &children {
      container.add_child(c.clone());
    }
    container.run().await;

    for c in children.iter().take(3) {
      c.run().await;
    }
    let done_before = container.progress().done();
    assert_eq!(done_before, 3);

    for c in children.iter().take(3) {
      container.clean_child(c).unwrap();
    }
    // Carried-over counters preserve the cleaned children's share.
    assert_eq!(container.progress().done(), done_before);
    assert_eq!(container.children().len(), 2);

    for c in children.iter().skip(3) {
      c.run().await;
    }
    assert_eq!(container.progress().state(), ComputationState::FinishedOk);
    assert_eq!(container.progress().done(), 5);
  }

  #[tokio::test]
  async fn cleaning_unfinished_child_is_rejected() {
    let container = ContainerExecution::new("c");
    let a = child("a");
    container.add_child(a.clone());

    assert!(matches!(
      container.clean_child(&a),
      Err(ExecError::CleanedUnfinishedChild { .. })
    ));
    assert_eq!(container.children().len(), 1);
  }

  #[tokio::test]
  async fn add_child_rejected_after_finishing() {
    let container = ContainerExecution::new("c");
    container.run().await;
    assert!(container.progress().is_finished());

    assert!(!container.add_child(child("late")));
  }

  #[tokio::test]
  async fn cancel_forwards_to_unfinished_children() {
    let container = ContainerExecution::new("c");
    let a = child("a");
    let b = child("b");
    container.add_child(a.clone());
    container.add_child(b.clone());
    container.run().await;

    a.run().await;
    container.cancel();

    assert_eq!(a.progress().state(), ComputationState::FinishedOk);
    assert_eq!(b.progress().state(), ComputationState::FinishedCancel);
    assert_eq!(
      container.progress().state(),
      ComputationState::FinishedCancel
    );
  }

  #[tokio::test]
  async fn cancel_covers_children_added_while_cancelling() {
    let container = ContainerExecution::new("c");
    let slow: TaskRef = Arc::new(AlgoTask::new(
      "slow",
      Arc::new(ConstWork::single("out", json!(1)).with_delay(Duration::from_secs(30))),
    ));
    container.add_child(slow.clone());
    container.run().await;

    let run = {
      let slow = slow.clone();
      tokio::spawn(async move { slow.run().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    container.cancel();
    // The forwarding snapshot is already taken; a child arriving now must
    // still be cancelled.
    let late = child("late");
    assert!(container.add_child(late.clone()));
    assert_eq!(late.progress().state(), ComputationState::FinishedCancel);

    run.await.unwrap();
    assert_eq!(slow.progress().state(), ComputationState::FinishedCancel);
    assert_eq!(
      container.progress().state(),
      ComputationState::FinishedCancel
    );
  }

  #[tokio::test]
  async fn hook_runs_before_terminal_transition() {
    struct Publishing;
    impl ContainerHook for Publishing {
      fn container_finished(&self, container: &ContainerExecution, state: ComputationState) {
        // The container is not yet terminal while the hook runs.
        assert!(!container.progress().is_finished());
        assert_eq!(state, ComputationState::FinishedOk);
        container.publish("sum", json!(42));
      }
    }

    let container = ContainerExecution::new("c");
    container.set_hook(Arc::new(Publishing));
    let a = child("a");
    container.add_child(a.clone());
    container.run().await;

    a.run().await;

    assert_eq!(container.progress().state(), ComputationState::FinishedOk);
    assert_eq!(container.result("sum"), Some(json!(42)));
  }

  #[tokio::test]
  async fn children_set_parent_to_container() {
    let container = ContainerExecution::new("c");
    let a = child("a");
    container.add_child(a.clone());

    let parent = a.parent().unwrap();
    assert_eq!(parent.id(), container.id());
  }

  #[tokio::test]
  async fn sink_receives_children_added_while_running() {
    struct Recording {
      submitted: Mutex<Vec<TaskId>>,
    }
    impl TaskSink for Recording {
      fn submit(&self, task: TaskRef) {
        self.submitted.lock().push(task.id());
      }
    }

    let container = ContainerExecution::new("c");
    let early = child("early");
    container.add_child(early.clone());

    let sink = Arc::new(Recording {
      submitted: Mutex::new(Vec::new()),
    });
    container.attach_sink(sink.clone());

    let late = child("late");
    container.add_child(late.clone());

    assert_eq!(*sink.submitted.lock(), vec![late.id()]);
  }

  #[tokio::test]
  async fn sink_learns_of_cleaned_children() {
    struct Recording {
      withdrawn: Mutex<Vec<TaskId>>,
    }
    impl TaskSink for Recording {
      fn submit(&self, _task: TaskRef) {}
      fn withdraw(&self, task: TaskRef) {
        self.withdrawn.lock().push(task.id());
      }
    }

    let container = ContainerExecution::new("c");
    let a = child("a");
    let b = child("b");
    container.add_child(a.clone());
    container.add_child(b.clone());
    let sink = Arc::new(Recording {
      withdrawn: Mutex::new(Vec::new()),
    });
    container.attach_sink(sink.clone());
    container.run().await;

    a.run().await;
    container.clean_child(&a).unwrap();

    assert_eq!(*sink.withdrawn.lock(), vec![a.id()]);
  }
}
