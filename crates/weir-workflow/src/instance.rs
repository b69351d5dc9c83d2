use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A configured, not-yet-executing node in the workflow graph.
///
/// Instances are immutable during a run. The `kind` names the algorithm type
/// and selects the execution factory that will produce a task for this
/// instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgoInstance {
  /// Unique instance ID within the workflow.
  pub instance_id: String,
  /// Human-readable name, used in logs and error messages.
  pub name: String,
  /// Algorithm type; selects the task factory.
  pub kind: String,
  /// Resolved parameter values.
  #[serde(default)]
  pub params: HashMap<String, serde_json::Value>,
  /// Declared input slots.
  #[serde(default)]
  pub inputs: Vec<String>,
  /// Declared output slots.
  #[serde(default)]
  pub outputs: Vec<String>,
  /// The container instance this one lives in, if any.
  #[serde(default)]
  pub container: Option<String>,
  /// Disabled instances are skipped at compile time with a user warning.
  #[serde(default)]
  pub disabled: bool,
  /// Maximum wall-clock duration for one execution of this instance.
  /// `None` disables the watchdog for the task (discouraged).
  #[serde(default)]
  pub timeout_ms: Option<u64>,
}

impl AlgoInstance {
  /// Create a minimal instance with no slots or parameters.
  pub fn new(instance_id: impl Into<String>, kind: impl Into<String>) -> Self {
    let instance_id = instance_id.into();
    Self {
      name: instance_id.clone(),
      instance_id,
      kind: kind.into(),
      params: HashMap::new(),
      inputs: Vec::new(),
      outputs: Vec::new(),
      container: None,
      disabled: false,
      timeout_ms: None,
    }
  }

  /// Check whether `slot` is a declared input.
  pub fn has_input(&self, slot: &str) -> bool {
    self.inputs.iter().any(|s| s == slot)
  }

  /// Check whether `slot` is a declared output.
  pub fn has_output(&self, slot: &str) -> bool {
    self.outputs.iter().any(|s| s == slot)
  }

  /// Look up a parameter value.
  pub fn param(&self, name: &str) -> Option<&serde_json::Value> {
    self.params.get(name)
  }
}
