//! The task runner: bounded dispatch over a compiled execution graph.
//!
//! The runner owns an mpsc mailbox. Worker completions and late task
//! submissions (children created by an already-running container) arrive as
//! messages; every wakeup re-scans the known tasks and dispatches whatever
//! became ready. A periodic watchdog forces tasks past their timeout into
//! `FinishedFailure`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use weir_exec::{
  panic_message, ComputationState, ExecutionEntities, TaskId, TaskRef, TaskSink,
};

use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};

/// Configuration for the task runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
  /// Maximum number of concurrently running non-costless tasks.
  pub worker_limit: usize,
  /// How often the watchdog scans for timed-out tasks.
  pub watchdog_interval: Duration,
}

impl Default for RunnerConfig {
  fn default() -> Self {
    Self {
      worker_limit: 4,
      watchdog_interval: Duration::from_millis(100),
    }
  }
}

enum RunnerMessage {
  /// A task became known after the run started.
  Submit(TaskRef),
  /// A finished task was cleaned out of its container.
  Withdraw(TaskRef),
  /// A worker finished (in any terminal state, or panicked).
  Done(TaskId),
}

/// The sink handed to containers so children added mid-run reach the mailbox.
struct SubmitHandle {
  sender: mpsc::UnboundedSender<RunnerMessage>,
}

impl TaskSink for SubmitHandle {
  fn submit(&self, task: TaskRef) {
    // The runner may already be gone; the task then simply never runs.
    let _ = self.sender.send(RunnerMessage::Submit(task));
  }

  fn withdraw(&self, task: TaskRef) {
    let _ = self.sender.send(RunnerMessage::Withdraw(task));
  }
}

/// Drives a task graph to completion.
pub struct TaskRunner {
  config: RunnerConfig,
  execution_id: String,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl TaskRunner {
  pub fn new(config: RunnerConfig) -> Self {
    Self {
      config,
      execution_id: Uuid::new_v4().to_string(),
      notifier: Arc::new(NoopNotifier),
    }
  }

  /// Report task membership and lifecycle to `notifier` under the given
  /// execution id instead of the generated one.
  pub fn with_notifier(
    mut self,
    execution_id: impl Into<String>,
    notifier: Arc<dyn ExecutionNotifier>,
  ) -> Self {
    self.execution_id = execution_id.into();
    self.notifier = notifier;
    self
  }

  /// Run `root` and everything reachable from it until the root reaches a
  /// terminal state. Cancelling the token cancels the whole graph; the runner
  /// still waits for the graph to settle before returning.
  #[instrument(name = "runner_drive", skip(self, root, cancel), fields(root = root.name()))]
  pub async fn drive(&self, root: TaskRef, cancel: CancellationToken) {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let sink: Arc<dyn TaskSink> = Arc::new(SubmitHandle {
      sender: sender.clone(),
    });

    let mut known: Vec<TaskRef> = Vec::new();
    let mut known_ids: HashSet<TaskId> = HashSet::new();
    let mut dispatched: HashSet<TaskId> = HashSet::new();
    let mut running = 0usize;
    let mut cancel_requested = false;

    self.register(root.clone(), &sink, &mut known, &mut known_ids);
    info!(tasks = known.len(), "runner starting");

    let mut watchdog = interval(self.config.watchdog_interval);
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      self
        .schedule(&known, &mut dispatched, &mut running, &sender)
        .await;

      if root.progress().is_finished() {
        break;
      }

      tokio::select! {
        message = receiver.recv() => match message {
          Some(RunnerMessage::Submit(task)) => {
            self.register(task, &sink, &mut known, &mut known_ids);
          }
          Some(RunnerMessage::Withdraw(task)) => {
            if known_ids.remove(&task.id()) {
              known.retain(|t| t.id() != task.id());
              debug!(task = task.name(), "task withdrawn");
              self.notifier.notify(ExecutionEvent::TaskRemoved {
                execution_id: self.execution_id.clone(),
                task: task.name().to_string(),
              });
            }
          }
          Some(RunnerMessage::Done(task_id)) => {
            running -= 1;
            debug!(%task_id, running, "worker finished");
          }
          // Unreachable while we hold a sender.
          None => break,
        },
        _ = watchdog.tick() => {
          self.patrol(&known);
        }
        _ = cancel.cancelled(), if !cancel_requested => {
          cancel_requested = true;
          warn!("cancellation requested; cancelling the task graph");
          root.cancel();
        }
      }
    }

    info!(state = ?root.progress().state(), "runner finished");
  }

  /// Dispatch every ready task, repeating until a pass dispatches nothing.
  /// Costless tasks run inline and may unblock successors within the same
  /// call, hence the fixpoint loop.
  async fn schedule(
    &self,
    known: &[TaskRef],
    dispatched: &mut HashSet<TaskId>,
    running: &mut usize,
    sender: &mpsc::UnboundedSender<RunnerMessage>,
  ) {
    loop {
      let mut ready: Vec<&TaskRef> = Vec::new();
      for task in known {
        if dispatched.contains(&task.id()) || task.progress().is_finished() {
          continue;
        }

        let prerequisites = task.prerequisites();
        let blocked = prerequisites.iter().any(|p| {
          p.progress().is_finished() && p.progress().state() != ComputationState::FinishedOk
        });
        if blocked {
          // A prerequisite can never deliver; the task will never become
          // ready. Connections usually cancelled it already, this covers
          // prerequisite edges without a connection.
          info!(task = task.name(), "prerequisite did not finish ok; cancelling");
          task.cancel();
          continue;
        }

        // `is_settled` and not just the terminal state: the prerequisite's
        // outputs are delivered from inside its listener pass, and a task
        // dispatched before that pass ended would snapshot empty inputs.
        let runnable = prerequisites.iter().all(|p| {
          p.progress().state() == ComputationState::FinishedOk && p.progress().is_settled()
        });
        if runnable {
          ready.push(task);
        }
      }
      ready.sort_by_key(|t| t.rank());

      let mut progressed = false;
      for task in ready {
        if task.is_costless() {
          dispatched.insert(task.id());
          debug!(task = task.name(), rank = task.rank(), "running inline");
          run_contained(task).await;
          progressed = true;
        } else if *running < self.config.worker_limit {
          dispatched.insert(task.id());
          *running += 1;
          debug!(
            task = task.name(),
            rank = task.rank(),
            running = *running,
            "dispatching to worker"
          );
          spawn_worker(task.clone(), sender.clone());
          progressed = true;
        }
      }

      if !progressed {
        return;
      }
    }
  }

  fn register(
    &self,
    task: TaskRef,
    sink: &Arc<dyn TaskSink>,
    known: &mut Vec<TaskRef>,
    known_ids: &mut HashSet<TaskId>,
  ) {
    let mut entities = ExecutionEntities::default();
    task.collect_entities(&mut entities);

    for task in std::iter::once(task).chain(entities.tasks) {
      if !known_ids.insert(task.id()) {
        continue;
      }
      if let Some(container) = task.as_container() {
        container.attach_sink(sink.clone());
      }
      debug!(task = task.name(), "task registered");
      self.notifier.notify(ExecutionEvent::TaskAdded {
        execution_id: self.execution_id.clone(),
        task: task.name().to_string(),
      });
      known.push(task);
    }
  }

  /// Force tasks past their timeout into `FinishedFailure` and kill them.
  fn patrol(&self, known: &[TaskRef]) {
    let now = Instant::now().into_std();
    for task in known {
      if task.progress().is_finished() {
        continue;
      }
      let Some(timeout) = task.timeout() else {
        continue;
      };
      let Some(started) = task.progress().started_at() else {
        continue;
      };
      if now.duration_since(started) > timeout {
        warn!(
          task = task.name(),
          ?timeout,
          "task exceeded its timeout; killing it"
        );
        task
          .progress()
          .record_failure(format!("timed out after {timeout:?}"));
        task.kill();
      }
    }
  }
}

/// Run the task, converting a panic in its unit of work into
/// `FinishedFailure` at the dispatch boundary. Both the inline path and the
/// workers route through this, so one exploding task never takes the runner
/// down.
async fn run_contained(task: &TaskRef) {
  let run = tokio::spawn({
    let task = task.clone();
    async move { task.run().await }
  });
  if let Err(join_error) = run.await {
    if join_error.is_panic() {
      let message = panic_message(join_error.into_panic().as_ref());
      error!(
        task = task.name(),
        panic = %message,
        "task panicked; forcing failure"
      );
      task.progress().record_failure(format!("panicked: {message}"));
    }
  }
}

fn spawn_worker(task: TaskRef, sender: mpsc::UnboundedSender<RunnerMessage>) {
  tokio::spawn(async move {
    run_contained(&task).await;
    let _ = sender.send(RunnerMessage::Done(task.id()));
  });
}
