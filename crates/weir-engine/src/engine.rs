//! Workflow compilation and execution.
//!
//! `Engine::compile` turns a validated workflow model into a graph of
//! execution entities: one leaf task per algorithm instance, one container
//! per instance that holds children, and one connection execution per edge.
//! The compiled `Execution` is then driven by the task runner.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use weir_exec::{
  AlgoTask, ComputationProgress, ComputationState, ConnectionExecution, ContainerExecution,
  ContainerPolicy, ExecutionEntities, ProgressListener, ReducePolicy, Task, TaskRef, UnitOfWork,
  propagate_ranks,
};
use weir_workflow::{AlgoInstance, ConnectionKind, Workflow};

use crate::error::{CompileError, EngineError};
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::runner::{RunnerConfig, TaskRunner};

/// Builds the unit of work for an algorithm instance.
///
/// This is the seam between the engine and the algorithm implementations: the
/// engine never knows what an instance computes, only how to wrap whatever
/// the factory returns into a task.
pub trait TaskFactory: Send + Sync {
  fn create(&self, instance: &AlgoInstance) -> Result<Arc<dyn UnitOfWork>, CompileError>;
}

type KindBuilder = Arc<dyn Fn(&AlgoInstance) -> Arc<dyn UnitOfWork> + Send + Sync>;

/// A task factory backed by a kind-to-builder map.
#[derive(Default)]
pub struct KindRegistry {
  builders: HashMap<String, KindBuilder>,
}

impl KindRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register<F>(&mut self, kind: impl Into<String>, builder: F)
  where
    F: Fn(&AlgoInstance) -> Arc<dyn UnitOfWork> + Send + Sync + 'static,
  {
    self.builders.insert(kind.into(), Arc::new(builder));
  }
}

impl TaskFactory for KindRegistry {
  fn create(&self, instance: &AlgoInstance) -> Result<Arc<dyn UnitOfWork>, CompileError> {
    let builder = self
      .builders
      .get(&instance.kind)
      .ok_or_else(|| CompileError::UnknownKind {
        instance_id: instance.instance_id.clone(),
        kind: instance.kind.clone(),
      })?;
    Ok(builder(instance))
  }
}

/// The engine: compiles workflows and drives their execution.
pub struct Engine {
  factory: Arc<dyn TaskFactory>,
  config: RunnerConfig,
}

impl Engine {
  pub fn new(factory: Arc<dyn TaskFactory>) -> Self {
    Self {
      factory,
      config: RunnerConfig::default(),
    }
  }

  pub fn with_config(mut self, config: RunnerConfig) -> Self {
    self.config = config;
    self
  }

  /// Compile a workflow into an executable graph.
  ///
  /// Instances referenced as somebody's container become container
  /// executions; everything else becomes a leaf task built by the factory.
  /// Disabled instances are skipped along with their connections, as are the
  /// children of disabled containers.
  #[instrument(name = "engine_compile", skip(self, workflow), fields(workflow_id = %workflow.workflow_id))]
  pub fn compile(&self, workflow: &Workflow) -> Result<Execution, CompileError> {
    workflow.validate()?;

    let container_ids: Vec<&str> = workflow
      .instances
      .iter()
      .filter_map(|i| i.container.as_deref())
      .collect();

    // Instantiate every enabled instance.
    let mut tasks: HashMap<String, TaskRef> = HashMap::new();
    let mut containers: HashMap<String, Arc<ContainerExecution>> = HashMap::new();
    for instance in &workflow.instances {
      if instance.disabled {
        debug!(instance_id = %instance.instance_id, "skipping disabled instance");
        continue;
      }
      let instance = Arc::new(instance.clone());
      if container_ids.contains(&instance.instance_id.as_str()) {
        let container =
          ContainerExecution::for_instance(instance.clone(), container_policy(&instance));
        containers.insert(instance.instance_id.clone(), container.clone());
        tasks.insert(instance.instance_id.clone(), container);
      } else {
        let work = self.factory.create(&instance)?;
        let mut task = AlgoTask::for_instance(instance.clone(), work);
        if reduce_policy(&instance) == ReducePolicy::Partial {
          task = task.with_reduce_policy(ReducePolicy::Partial);
        }
        tasks.insert(instance.instance_id.clone(), Arc::new(task));
      }
    }

    // Wire up containment. Children of disabled containers are dropped.
    let root = ContainerExecution::new(workflow.name.clone());
    for instance in &workflow.instances {
      let Some(task) = tasks.get(&instance.instance_id).cloned() else {
        continue;
      };
      match instance.container.as_deref() {
        None => {
          root.add_child(task);
        }
        Some(container_id) => match containers.get(container_id) {
          Some(container) => {
            container.add_child(task);
          }
          None => {
            debug!(
              instance_id = %instance.instance_id,
              container = container_id,
              "dropping child of disabled container"
            );
            tasks.remove(&instance.instance_id);
          }
        },
      }
    }

    // Wire up connections; each one lives in the scope of its consumer.
    for connection in &workflow.connections {
      let (Some(from), Some(to)) = (
        tasks.get(&connection.from_instance),
        tasks.get(&connection.to_instance),
      ) else {
        debug!(
          connection_id = %connection.connection_id,
          "skipping connection with a disabled endpoint"
        );
        continue;
      };

      let executable = ConnectionExecution::link(
        connection.connection_id.clone(),
        connection.kind,
        from,
        connection.from_output.clone(),
        to,
        connection.to_input.clone(),
      );

      if connection.kind == ConnectionKind::IterationToReduce {
        // The reduce consumer waits for the whole iteration, not for any
        // single branch.
        if let Some(container_id) = workflow.scope_of(&connection.from_instance) {
          if let Some(container) = tasks.get(container_id) {
            to.add_prerequisite(container.clone());
          }
        }
      }

      let scope = workflow.scope_of(&connection.to_instance);
      match scope.and_then(|s| containers.get(s)) {
        Some(container) => container.add_connection(executable),
        None => root.add_connection(executable),
      }
    }

    // Ranks are per scope: the top level and each container's sub-graph rank
    // independently.
    let mut scopes: Vec<(Vec<TaskRef>, Arc<ContainerExecution>)> = vec![(
      root.children(),
      root.clone(),
    )];
    for container in containers.values() {
      scopes.push((container.children(), container.clone()));
    }
    for (members, owner) in &scopes {
      let mut entities = ExecutionEntities::default();
      owner.collect_entities(&mut entities);
      propagate_ranks(members, &entities.connections)?;
    }

    let execution_id = Uuid::new_v4().to_string();
    info!(
      execution_id = %execution_id,
      tasks = tasks.len(),
      "workflow compiled"
    );

    Ok(Execution {
      execution_id,
      workflow_id: workflow.workflow_id.clone(),
      root,
      tasks,
    })
  }

  /// Compile and run a workflow in one call.
  pub async fn execute(
    &self,
    workflow: &Workflow,
    notifier: Arc<dyn ExecutionNotifier>,
    cancel: CancellationToken,
  ) -> Result<ExecutionReport, EngineError> {
    let execution = self.compile(workflow)?;
    Ok(execution.run(self.config.clone(), notifier, cancel).await)
  }
}

fn reduce_policy(instance: &AlgoInstance) -> ReducePolicy {
  match instance.param("reduce_policy").and_then(|v| v.as_str()) {
    Some("partial") => ReducePolicy::Partial,
    _ => ReducePolicy::Strict,
  }
}

fn container_policy(instance: &AlgoInstance) -> ContainerPolicy {
  ContainerPolicy {
    ignore_child_failures: instance
      .param("ignore_failures")
      .and_then(|v| v.as_bool())
      .unwrap_or(false),
    ignore_child_cancel: instance
      .param("ignore_cancel")
      .and_then(|v| v.as_bool())
      .unwrap_or(false),
  }
}

/// A compiled workflow: the executable graph plus lookup tables.
pub struct Execution {
  execution_id: String,
  workflow_id: String,
  root: Arc<ContainerExecution>,
  tasks: HashMap<String, TaskRef>,
}

impl Execution {
  pub fn execution_id(&self) -> &str {
    &self.execution_id
  }

  pub fn root(&self) -> &Arc<ContainerExecution> {
    &self.root
  }

  /// The task compiled from an instance.
  pub fn task(&self, instance_id: &str) -> Option<&TaskRef> {
    self.tasks.get(instance_id)
  }

  /// Every task and connection in the graph, for monitoring.
  pub fn entities(&self) -> ExecutionEntities {
    let mut entities = ExecutionEntities::default();
    self.root.collect_entities(&mut entities);
    entities
  }

  /// Drive the graph to completion and report the outcome.
  #[instrument(
    name = "execution_run",
    skip(self, config, notifier, cancel),
    fields(execution_id = %self.execution_id, workflow_id = %self.workflow_id)
  )]
  pub async fn run(
    &self,
    config: RunnerConfig,
    notifier: Arc<dyn ExecutionNotifier>,
    cancel: CancellationToken,
  ) -> ExecutionReport {
    let started = Instant::now();
    notifier.notify(ExecutionEvent::ExecutionStarted {
      execution_id: self.execution_id.clone(),
      workflow_id: self.workflow_id.clone(),
    });

    // The bridge must outlive the run; listeners are weak.
    let bridge = EventBridge::attach(self.execution_id.clone(), notifier.clone(), self);

    let runner = TaskRunner::new(config)
      .with_notifier(self.execution_id.clone(), notifier.clone());
    let root: TaskRef = self.root.clone();
    runner.drive(root, cancel).await;

    let state = self.root.progress().state();
    notifier.notify(ExecutionEvent::ExecutionFinished {
      execution_id: self.execution_id.clone(),
      state,
    });
    drop(bridge);

    let tasks = self
      .tasks
      .iter()
      .map(|(instance_id, task)| {
        (
          instance_id.clone(),
          TaskReport {
            state: task.progress().state(),
            failure: task.progress().failure(),
          },
        )
      })
      .collect();

    ExecutionReport {
      execution_id: self.execution_id.clone(),
      state,
      elapsed: started.elapsed(),
      tasks,
    }
  }

  /// Run with default runner settings and no observer.
  pub async fn run_default(&self) -> ExecutionReport {
    self
      .run(
        RunnerConfig::default(),
        Arc::new(NoopNotifier),
        CancellationToken::new(),
      )
      .await
  }
}

/// Outcome of one task, keyed by instance ID in the report.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
  pub state: ComputationState,
  pub failure: Option<String>,
}

/// Outcome of a whole execution.
#[derive(Debug, Serialize)]
pub struct ExecutionReport {
  pub execution_id: String,
  pub state: ComputationState,
  #[serde(skip)]
  pub elapsed: Duration,
  pub tasks: HashMap<String, TaskReport>,
}

impl ExecutionReport {
  pub fn is_ok(&self) -> bool {
    self.state == ComputationState::FinishedOk
  }
}

/// Translates progress transitions into execution events.
struct EventBridge {
  execution_id: String,
  notifier: Arc<dyn ExecutionNotifier>,
}

impl EventBridge {
  fn attach(
    execution_id: String,
    notifier: Arc<dyn ExecutionNotifier>,
    execution: &Execution,
  ) -> Arc<Self> {
    let bridge = Arc::new(Self {
      execution_id,
      notifier,
    });
    let mut entities = execution.entities();
    entities.tasks.push(execution.root.clone());
    for task in &entities.tasks {
      let listener = Arc::downgrade(&bridge) as Weak<dyn ProgressListener>;
      task.progress().add_listener(listener);
    }
    bridge
  }
}

impl ProgressListener for EventBridge {
  fn computation_state_changed(&self, progress: &ComputationProgress) {
    let state = progress.state();
    let event = match state {
      ComputationState::Started => ExecutionEvent::TaskStarted {
        execution_id: self.execution_id.clone(),
        task: progress.task_name().to_string(),
      },
      state if state.is_finished() => ExecutionEvent::TaskFinished {
        execution_id: self.execution_id.clone(),
        task: progress.task_name().to_string(),
        state,
        error: progress.failure(),
      },
      _ => return,
    };
    self.notifier.notify(event);
  }
}
