use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::connection::{Connection, ConnectionKind};
use crate::error::WorkflowError;
use crate::instance::AlgoInstance;

/// A compiled workflow ready for execution.
///
/// Instances and connections are ordered collections; ordering is preserved
/// through compilation so listener registration and scheduling seeds are
/// deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
  pub workflow_id: String,
  pub name: String,
  pub instances: Vec<AlgoInstance>,
  pub connections: Vec<Connection>,
}

impl Workflow {
  pub fn new(workflow_id: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      workflow_id: workflow_id.into(),
      name: name.into(),
      instances: Vec::new(),
      connections: Vec::new(),
    }
  }

  /// Look up an instance by ID.
  pub fn get_instance(&self, instance_id: &str) -> Option<&AlgoInstance> {
    self
      .instances
      .iter()
      .find(|i| i.instance_id == instance_id)
  }

  /// The container scope an instance lives in (`None` is the top level).
  pub fn scope_of(&self, instance_id: &str) -> Option<&str> {
    self
      .get_instance(instance_id)
      .and_then(|i| i.container.as_deref())
  }

  /// Validate the workflow model.
  ///
  /// Checks identifier uniqueness, slot references, container membership and
  /// the container-boundary rules for both connection kinds. Cycle detection
  /// between instances is not done here; that is the rank propagation's job,
  /// where the offending task can be named with execution context.
  pub fn validate(&self) -> Result<(), WorkflowError> {
    let mut seen = HashSet::new();
    for instance in &self.instances {
      if !seen.insert(instance.instance_id.as_str()) {
        return Err(WorkflowError::DuplicateInstance {
          instance_id: instance.instance_id.clone(),
        });
      }
    }

    self.validate_containers()?;

    let mut seen_connections = HashSet::new();
    for connection in &self.connections {
      if !seen_connections.insert(connection.connection_id.as_str()) {
        return Err(WorkflowError::DuplicateConnection {
          connection_id: connection.connection_id.clone(),
        });
      }
      self.validate_connection(connection)?;
    }

    Ok(())
  }

  fn validate_containers(&self) -> Result<(), WorkflowError> {
    let by_id: HashMap<&str, &AlgoInstance> = self
      .instances
      .iter()
      .map(|i| (i.instance_id.as_str(), i))
      .collect();

    for instance in &self.instances {
      let Some(container) = instance.container.as_deref() else {
        continue;
      };
      if !by_id.contains_key(container) {
        return Err(WorkflowError::UnknownContainer {
          instance_id: instance.instance_id.clone(),
          container: container.to_string(),
        });
      }

      // Walk up the membership chain; revisiting an id means a cycle.
      let mut visited = HashSet::new();
      let mut current = instance.instance_id.as_str();
      while let Some(parent) = by_id.get(current).and_then(|i| i.container.as_deref()) {
        if !visited.insert(parent) {
          return Err(WorkflowError::ContainerCycle {
            instance_id: instance.instance_id.clone(),
          });
        }
        current = parent;
      }
    }

    Ok(())
  }

  fn validate_connection(&self, connection: &Connection) -> Result<(), WorkflowError> {
    let from = self.get_instance(&connection.from_instance).ok_or_else(|| {
      WorkflowError::UnknownInstance {
        connection_id: connection.connection_id.clone(),
        instance_id: connection.from_instance.clone(),
      }
    })?;
    let to = self.get_instance(&connection.to_instance).ok_or_else(|| {
      WorkflowError::UnknownInstance {
        connection_id: connection.connection_id.clone(),
        instance_id: connection.to_instance.clone(),
      }
    })?;

    if !from.has_output(&connection.from_output) {
      return Err(WorkflowError::UnknownSlot {
        connection_id: connection.connection_id.clone(),
        instance_id: from.instance_id.clone(),
        slot: connection.from_output.clone(),
      });
    }
    if !to.has_input(&connection.to_input) {
      return Err(WorkflowError::UnknownSlot {
        connection_id: connection.connection_id.clone(),
        instance_id: to.instance_id.clone(),
        slot: connection.to_input.clone(),
      });
    }

    match connection.kind {
      ConnectionKind::Direct => {
        if from.container != to.container {
          return Err(WorkflowError::CrossContainerConnection {
            connection_id: connection.connection_id.clone(),
          });
        }
      }
      ConnectionKind::IterationToReduce => {
        // The producer must be a container child; the reduce consumer lives
        // in the same scope as that container.
        let Some(container) = from.container.as_deref() else {
          return Err(WorkflowError::InvalidReduceConnection {
            connection_id: connection.connection_id.clone(),
            message: "producer is not contained in an iteration".to_string(),
          });
        };
        let container_scope = self.scope_of(container);
        if to.container.as_deref() != container_scope {
          return Err(WorkflowError::InvalidReduceConnection {
            connection_id: connection.connection_id.clone(),
            message: format!(
              "reduce consumer '{}' is not in the scope enclosing container '{}'",
              to.instance_id, container
            ),
          });
        }
      }
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn instance(id: &str, container: Option<&str>) -> AlgoInstance {
    let mut instance = AlgoInstance::new(id, "noop");
    instance.inputs = vec!["in".to_string()];
    instance.outputs = vec!["out".to_string()];
    instance.container = container.map(|c| c.to_string());
    instance
  }

  #[test]
  fn valid_flat_workflow() {
    let mut workflow = Workflow::new("w", "test");
    workflow.instances.push(instance("a", None));
    workflow.instances.push(instance("b", None));
    workflow
      .connections
      .push(Connection::direct("c1", ("a", "out"), ("b", "in")));

    assert!(workflow.validate().is_ok());
  }

  #[test]
  fn duplicate_instance_rejected() {
    let mut workflow = Workflow::new("w", "test");
    workflow.instances.push(instance("a", None));
    workflow.instances.push(instance("a", None));

    assert!(matches!(
      workflow.validate(),
      Err(WorkflowError::DuplicateInstance { .. })
    ));
  }

  #[test]
  fn undeclared_slot_rejected() {
    let mut workflow = Workflow::new("w", "test");
    workflow.instances.push(instance("a", None));
    workflow.instances.push(instance("b", None));
    workflow
      .connections
      .push(Connection::direct("c1", ("a", "missing"), ("b", "in")));

    assert!(matches!(
      workflow.validate(),
      Err(WorkflowError::UnknownSlot { .. })
    ));
  }

  #[test]
  fn direct_connection_may_not_cross_containers() {
    let mut workflow = Workflow::new("w", "test");
    workflow.instances.push(instance("loop", None));
    workflow.instances.push(instance("inner", Some("loop")));
    workflow.instances.push(instance("outside", None));
    workflow
      .connections
      .push(Connection::direct("c1", ("inner", "out"), ("outside", "in")));

    assert!(matches!(
      workflow.validate(),
      Err(WorkflowError::CrossContainerConnection { .. })
    ));
  }

  #[test]
  fn reduce_connection_crosses_one_level() {
    let mut workflow = Workflow::new("w", "test");
    workflow.instances.push(instance("loop", None));
    workflow.instances.push(instance("inner", Some("loop")));
    workflow.instances.push(instance("reduce", None));
    workflow.connections.push(Connection::iteration_to_reduce(
      "c1",
      ("inner", "out"),
      ("reduce", "in"),
    ));

    assert!(workflow.validate().is_ok());
  }

  #[test]
  fn container_cycle_rejected() {
    let mut workflow = Workflow::new("w", "test");
    workflow.instances.push(instance("a", Some("b")));
    workflow.instances.push(instance("b", Some("a")));

    assert!(matches!(
      workflow.validate(),
      Err(WorkflowError::ContainerCycle { .. })
    ));
  }
}
