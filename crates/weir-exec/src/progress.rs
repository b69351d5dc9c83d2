//! Computation progress and its listeners.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::task::TaskId;

/// Lifecycle state of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputationState {
  Created,
  Started,
  FinishedOk,
  FinishedCancel,
  FinishedFailure,
}

impl ComputationState {
  /// All three terminal states share this predicate.
  pub fn is_finished(self) -> bool {
    matches!(
      self,
      ComputationState::FinishedOk
        | ComputationState::FinishedCancel
        | ComputationState::FinishedFailure
    )
  }
}

/// Observer notified of state transitions only.
pub trait ProgressListener: Send + Sync {
  fn computation_state_changed(&self, progress: &ComputationProgress);
}

/// Observer notified of every progress-counter change.
pub trait DetailedProgressListener: Send + Sync {
  fn computation_progress_changed(&self, progress: &ComputationProgress);
}

struct ProgressInner {
  state: ComputationState,
  done: u64,
  total: u64,
  started_at: Option<Instant>,
  failure: Option<String>,
}

/// Mutable state holder for one unit of work.
///
/// Only the owning task mutates its progress; listeners are read-only
/// observers. Setting a finished state is terminal: later mutations are
/// ignored with a log. Listeners are notified synchronously, in registration
/// order, after the internal lock has been released, so a listener may
/// re-enter its container (e.g. add a new child) without deadlocking. A
/// panicking listener is caught and logged; the remaining listeners are still
/// notified.
pub struct ComputationProgress {
  task_id: TaskId,
  task_name: String,
  created_at: Instant,
  inner: Mutex<ProgressInner>,
  /// Set after the terminal state's listener pass completed. Connections
  /// deliver values from inside that pass, so anyone gating on `FinishedOk`
  /// alone can observe the state before the outputs arrived downstream.
  settled: AtomicBool,
  listeners: Mutex<Vec<Weak<dyn ProgressListener>>>,
  detailed_listeners: Mutex<Vec<Weak<dyn DetailedProgressListener>>>,
}

impl ComputationProgress {
  pub fn new(task_id: TaskId, task_name: impl Into<String>) -> Arc<Self> {
    Arc::new(Self {
      task_id,
      task_name: task_name.into(),
      created_at: Instant::now(),
      inner: Mutex::new(ProgressInner {
        state: ComputationState::Created,
        done: 0,
        total: 0,
        started_at: None,
        failure: None,
      }),
      settled: AtomicBool::new(false),
      listeners: Mutex::new(Vec::new()),
      detailed_listeners: Mutex::new(Vec::new()),
    })
  }

  /// The task this progress belongs to.
  pub fn task_id(&self) -> TaskId {
    self.task_id
  }

  pub fn task_name(&self) -> &str {
    &self.task_name
  }

  pub fn state(&self) -> ComputationState {
    self.inner.lock().state
  }

  pub fn is_finished(&self) -> bool {
    self.state().is_finished()
  }

  /// Whether the terminal transition has fully propagated to the listeners.
  ///
  /// Schedulers gate dependents on this rather than on the bare state: a
  /// consumer dispatched between the state commit and the end of the listener
  /// pass would snapshot its inputs before the connections delivered them.
  pub fn is_settled(&self) -> bool {
    self.settled.load(Ordering::Acquire)
  }

  pub fn done(&self) -> u64 {
    self.inner.lock().done
  }

  pub fn total(&self) -> u64 {
    self.inner.lock().total
  }

  pub fn created_at(&self) -> Instant {
    self.created_at
  }

  pub fn started_at(&self) -> Option<Instant> {
    self.inner.lock().started_at
  }

  /// The failure message recorded by [`record_failure`](Self::record_failure).
  pub fn failure(&self) -> Option<String> {
    self.inner.lock().failure.clone()
  }

  /// Transition to a new state and notify state listeners.
  ///
  /// A transition out of a finished state is rejected: there is no
  /// un-finishing.
  pub fn set_state(&self, state: ComputationState) {
    {
      let mut inner = self.inner.lock();
      if inner.state.is_finished() {
        warn!(
          task_id = %self.task_id,
          task = %self.task_name,
          current = ?inner.state,
          requested = ?state,
          "ignoring state change on finished progress"
        );
        return;
      }
      if inner.state == state {
        return;
      }
      if state == ComputationState::Started && inner.started_at.is_none() {
        inner.started_at = Some(Instant::now());
      }
      inner.state = state;
    }
    self.notify_state_changed();
    if state.is_finished() {
      self.settled.store(true, Ordering::Release);
    }
  }

  /// Record a failure message and transition to `FinishedFailure`.
  pub fn record_failure(&self, message: impl Into<String>) {
    {
      let mut inner = self.inner.lock();
      if inner.state.is_finished() {
        return;
      }
      inner.failure = Some(message.into());
    }
    self.set_state(ComputationState::FinishedFailure);
  }

  /// Update the done counter and notify detailed listeners.
  ///
  /// Counters never regress: a smaller value than the current one is ignored,
  /// which keeps aggregate progress monotonic when concurrent aggregations
  /// race.
  pub fn set_done(&self, done: u64) {
    {
      let mut inner = self.inner.lock();
      if done <= inner.done {
        return;
      }
      inner.done = done;
    }
    self.notify_progress_changed();
  }

  /// Update the total counter and notify detailed listeners. The total may
  /// grow as children are discovered; it never shrinks.
  pub fn set_total(&self, total: u64) {
    {
      let mut inner = self.inner.lock();
      if total <= inner.total {
        return;
      }
      inner.total = total;
    }
    self.notify_progress_changed();
  }

  /// Return the progress to `Created` so the owning task can run again
  /// (repeated execution inside an iteration). This is an owner-level
  /// operation, not a state transition: listeners are not notified and stay
  /// registered.
  pub fn reset(&self) {
    let mut inner = self.inner.lock();
    inner.state = ComputationState::Created;
    inner.done = 0;
    inner.total = 0;
    inner.started_at = None;
    inner.failure = None;
    self.settled.store(false, Ordering::Release);
  }

  pub fn add_listener(&self, listener: Weak<dyn ProgressListener>) {
    self.listeners.lock().push(listener);
  }

  pub fn add_detailed_listener(&self, listener: Weak<dyn DetailedProgressListener>) {
    self.detailed_listeners.lock().push(listener);
  }

  fn notify_state_changed(&self) {
    let listeners = self.listeners.lock().clone();
    for listener in &listeners {
      let Some(listener) = listener.upgrade() else {
        continue;
      };
      let result = catch_unwind(AssertUnwindSafe(|| listener.computation_state_changed(self)));
      if let Err(payload) = result {
        error!(
          task_id = %self.task_id,
          task = %self.task_name,
          panic = %panic_message(payload.as_ref()),
          "progress listener panicked during state notification"
        );
      }
    }
    self.listeners.lock().retain(|w| w.strong_count() > 0);
  }

  fn notify_progress_changed(&self) {
    let listeners = self.detailed_listeners.lock().clone();
    for listener in &listeners {
      let Some(listener) = listener.upgrade() else {
        continue;
      };
      let result = catch_unwind(AssertUnwindSafe(|| listener.computation_progress_changed(self)));
      if let Err(payload) = result {
        error!(
          task_id = %self.task_id,
          task = %self.task_name,
          panic = %panic_message(payload.as_ref()),
          "progress listener panicked during progress notification"
        );
      }
    }
    self
      .detailed_listeners
      .lock()
      .retain(|w| w.strong_count() > 0);
  }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  struct CountingListener {
    calls: AtomicUsize,
  }

  impl CountingListener {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        calls: AtomicUsize::new(0),
      })
    }
  }

  impl ProgressListener for CountingListener {
    fn computation_state_changed(&self, _progress: &ComputationProgress) {
      self.calls.fetch_add(1, Ordering::SeqCst);
    }
  }

  struct PanickingListener;

  impl ProgressListener for PanickingListener {
    fn computation_state_changed(&self, _progress: &ComputationProgress) {
      panic!("listener blew up");
    }
  }

  fn test_progress() -> Arc<ComputationProgress> {
    ComputationProgress::new(TaskId::new(), "test")
  }

  #[test]
  fn terminal_transition_happens_once() {
    let progress = test_progress();
    progress.set_state(ComputationState::Started);
    progress.set_state(ComputationState::FinishedOk);
    progress.set_state(ComputationState::FinishedFailure);

    assert_eq!(progress.state(), ComputationState::FinishedOk);
  }

  #[test]
  fn listeners_notified_in_registration_order() {
    let progress = test_progress();
    let order = Arc::new(Mutex::new(Vec::new()));

    struct OrderListener {
      tag: u32,
      order: Arc<Mutex<Vec<u32>>>,
    }
    impl ProgressListener for OrderListener {
      fn computation_state_changed(&self, _progress: &ComputationProgress) {
        self.order.lock().push(self.tag);
      }
    }

    let first = Arc::new(OrderListener {
      tag: 1,
      order: order.clone(),
    });
    let second = Arc::new(OrderListener {
      tag: 2,
      order: order.clone(),
    });
    progress.add_listener(Arc::downgrade(&first) as Weak<dyn ProgressListener>);
    progress.add_listener(Arc::downgrade(&second) as Weak<dyn ProgressListener>);

    progress.set_state(ComputationState::Started);
    assert_eq!(*order.lock(), vec![1, 2]);
  }

  #[test]
  fn panicking_listener_does_not_stop_notification() {
    let progress = test_progress();
    let bad = Arc::new(PanickingListener);
    let good = CountingListener::new();

    progress.add_listener(Arc::downgrade(&bad) as Weak<dyn ProgressListener>);
    progress.add_listener(Arc::downgrade(&good) as Weak<dyn ProgressListener>);

    progress.set_state(ComputationState::Started);
    assert_eq!(good.calls.load(Ordering::SeqCst), 1);
    // State survived the panic.
    assert_eq!(progress.state(), ComputationState::Started);
  }

  #[test]
  fn terminal_state_settles_only_after_the_listener_pass() {
    struct SettleCheck {
      settled_during_notify: AtomicBool,
    }
    impl ProgressListener for SettleCheck {
      fn computation_state_changed(&self, progress: &ComputationProgress) {
        if progress.state().is_finished() {
          self
            .settled_during_notify
            .store(progress.is_settled(), Ordering::SeqCst);
        }
      }
    }

    let progress = test_progress();
    let check = Arc::new(SettleCheck {
      settled_during_notify: AtomicBool::new(true),
    });
    progress.add_listener(Arc::downgrade(&check) as Weak<dyn ProgressListener>);

    progress.set_state(ComputationState::Started);
    assert!(!progress.is_settled());

    progress.set_state(ComputationState::FinishedOk);
    // Listeners observed the terminal state before it settled.
    assert!(!check.settled_during_notify.load(Ordering::SeqCst));
    assert!(progress.is_settled());

    progress.reset();
    assert!(!progress.is_settled());
  }

  #[test]
  fn counters_never_regress() {
    let progress = test_progress();
    progress.set_total(10);
    progress.set_done(4);
    progress.set_total(3);
    progress.set_done(2);

    assert_eq!(progress.total(), 10);
    assert_eq!(progress.done(), 4);
  }

  #[test]
  fn failure_records_message() {
    let progress = test_progress();
    progress.set_state(ComputationState::Started);
    progress.record_failure("division by zero");

    assert_eq!(progress.state(), ComputationState::FinishedFailure);
    assert_eq!(progress.failure().as_deref(), Some("division by zero"));
  }

  #[test]
  fn reset_returns_to_created() {
    let progress = test_progress();
    progress.set_state(ComputationState::Started);
    progress.set_done(3);
    progress.set_state(ComputationState::FinishedOk);

    progress.reset();
    assert_eq!(progress.state(), ComputationState::Created);
    assert_eq!(progress.done(), 0);
    assert!(progress.started_at().is_none());
  }
}
