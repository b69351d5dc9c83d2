use thiserror::Error;

/// Model-level validation errors.
///
/// These are configuration/contract violations: fatal to compiling the
/// workflow, never recoverable per-task failures.
#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("duplicate instance id: {instance_id}")]
  DuplicateInstance { instance_id: String },

  #[error("duplicate connection id: {connection_id}")]
  DuplicateConnection { connection_id: String },

  #[error("connection '{connection_id}' references unknown instance '{instance_id}'")]
  UnknownInstance {
    connection_id: String,
    instance_id: String,
  },

  #[error("connection '{connection_id}' references undeclared slot '{slot}' on instance '{instance_id}'")]
  UnknownSlot {
    connection_id: String,
    instance_id: String,
    slot: String,
  },

  #[error("direct connection '{connection_id}' crosses a container boundary")]
  CrossContainerConnection { connection_id: String },

  #[error("invalid iteration-to-reduce connection '{connection_id}': {message}")]
  InvalidReduceConnection {
    connection_id: String,
    message: String,
  },

  #[error("instance '{instance_id}' references unknown container '{container}'")]
  UnknownContainer {
    instance_id: String,
    container: String,
  },

  #[error("container membership of instance '{instance_id}' is cyclic")]
  ContainerCycle { instance_id: String },
}
