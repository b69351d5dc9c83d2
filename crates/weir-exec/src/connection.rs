//! Executable counterpart of a graph edge.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info};
use weir_workflow::ConnectionKind;

use crate::error::ExecError;
use crate::progress::{ComputationProgress, ComputationState, ProgressListener};
use crate::task::{Delivery, Task, TaskId, TaskRef};

/// Observes a producer task's progress and, on success, pushes the published
/// value into the consumer.
///
/// A connection never owns its endpoints: it holds weak references and only
/// observes the producer and mutates the consumer through its input-receive
/// contract. Two kinds exist: direct pass-through, and iteration-to-reduce
/// where many producer firings collapse into one consumer, each delivery
/// tagged with the originating branch.
pub struct ConnectionExecution {
  connection_id: String,
  kind: ConnectionKind,
  from_output: String,
  to_input: String,
  from: Weak<dyn Task>,
  to: Weak<dyn Task>,
  value: Mutex<Option<Value>>,
}

impl ConnectionExecution {
  /// Create the connection and register it as a listener on the producer's
  /// progress. For a direct connection the producer also becomes a
  /// prerequisite of the consumer; the reduce kind intentionally does not
  /// gate the consumer on a single branch (the engine gates it on the whole
  /// iteration container instead).
  pub fn link(
    connection_id: impl Into<String>,
    kind: ConnectionKind,
    from: &TaskRef,
    from_output: impl Into<String>,
    to: &TaskRef,
    to_input: impl Into<String>,
  ) -> Arc<Self> {
    let connection = Arc::new(Self {
      connection_id: connection_id.into(),
      kind,
      from_output: from_output.into(),
      to_input: to_input.into(),
      from: Arc::downgrade(from),
      to: Arc::downgrade(to),
      value: Mutex::new(None),
    });

    let listener = Arc::downgrade(&connection) as Weak<dyn ProgressListener>;
    from.progress().add_listener(listener);

    if kind == ConnectionKind::Direct {
      to.add_prerequisite(from.clone());
    }

    connection
  }

  pub fn connection_id(&self) -> &str {
    &self.connection_id
  }

  pub fn kind(&self) -> ConnectionKind {
    self.kind
  }

  pub fn from_task(&self) -> Option<TaskRef> {
    self.from.upgrade()
  }

  pub fn to_task(&self) -> Option<TaskRef> {
    self.to.upgrade()
  }

  /// The last transmitted value, if any.
  pub fn last_value(&self) -> Option<Value> {
    self.value.lock().clone()
  }

  /// Inject a value bypassing the producer. Only the direct kind supports
  /// this; the reduce kind fails loudly rather than silently ignoring it.
  pub fn force_value(&self, value: Value) -> Result<(), ExecError> {
    match self.kind {
      ConnectionKind::Direct => {
        *self.value.lock() = Some(value.clone());
        if let Some(to) = self.to.upgrade() {
          to.receive_input(Delivery::Direct, &self.to_input, value);
        }
        Ok(())
      }
      ConnectionKind::IterationToReduce => Err(ExecError::ForceValueUnsupported {
        connection_id: self.connection_id.clone(),
      }),
    }
  }

  /// The identity a reduce delivery is tagged with: the producer's parent
  /// (the iteration that spawned the branch), falling back to the producer
  /// itself.
  fn branch_identity(&self, from: &TaskRef) -> Option<TaskId> {
    Some(from.parent().map(|p| p.id()).unwrap_or_else(|| from.id()))
  }
}

impl ProgressListener for ConnectionExecution {
  fn computation_state_changed(&self, progress: &ComputationProgress) {
    let state = progress.state();
    if !state.is_finished() {
      return;
    }
    let Some(to) = self.to.upgrade() else {
      return;
    };

    match state {
      ComputationState::FinishedCancel | ComputationState::FinishedFailure => {
        *self.value.lock() = None;
        match self.kind {
          ConnectionKind::Direct => {
            info!(
              connection = %self.connection_id,
              consumer = to.name(),
              producer_state = ?state,
              "producer did not finish ok; cancelling consumer"
            );
            to.cancel();
          }
          ConnectionKind::IterationToReduce => {
            let branch = self.from.upgrade().and_then(|f| self.branch_identity(&f));
            to.branch_aborted(branch, &self.to_input);
          }
        }
      }
      ComputationState::FinishedOk => {
        let Some(from) = self.from.upgrade() else {
          return;
        };
        let value = from.result(&self.from_output);
        if value.is_none() {
          // Reportable anomaly, not fatal: delivery is still attempted.
          error!(
            connection = %self.connection_id,
            producer = from.name(),
            output = %self.from_output,
            "producer finished ok but published no value for the connected output"
          );
        }
        let value = value.unwrap_or(Value::Null);
        *self.value.lock() = Some(value.clone());

        match self.kind {
          ConnectionKind::Direct => {
            debug!(
              connection = %self.connection_id,
              consumer = to.name(),
              "delivering value"
            );
            to.receive_input(Delivery::Direct, &self.to_input, value);
          }
          ConnectionKind::IterationToReduce => {
            let branch = self.branch_identity(&from);
            debug!(
              connection = %self.connection_id,
              consumer = to.name(),
              branch = ?branch,
              "delivering branch value"
            );
            to.receive_input(Delivery::Branch(branch), &self.to_input, value);
          }
        }
      }
      _ => {
        // Defensive: a finished state that is none of the three above cannot
        // currently exist.
        *self.value.lock() = None;
      }
    }
  }
}
