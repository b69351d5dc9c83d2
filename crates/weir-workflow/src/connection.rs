use serde::{Deserialize, Serialize};

/// How a connection delivers values from producer to consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
  /// One producer firing results in one consumer notification.
  Direct,
  /// The producer is one branch of a fan-out (e.g. one loop iteration); the
  /// reduce consumer assembles a collection across all branches. These
  /// connections intentionally break the topological chain: the reduce side
  /// becomes ready when the whole iteration set finishes, not when a single
  /// branch does.
  IterationToReduce,
}

/// A typed data link between a producer output and a consumer input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
  /// Unique connection ID within the workflow.
  pub connection_id: String,
  /// Producer instance ID.
  pub from_instance: String,
  /// Producer output slot.
  pub from_output: String,
  /// Consumer instance ID.
  pub to_instance: String,
  /// Consumer input slot.
  pub to_input: String,
  pub kind: ConnectionKind,
}

impl Connection {
  /// Create a direct connection.
  pub fn direct(
    connection_id: impl Into<String>,
    from: (impl Into<String>, impl Into<String>),
    to: (impl Into<String>, impl Into<String>),
  ) -> Self {
    Self {
      connection_id: connection_id.into(),
      from_instance: from.0.into(),
      from_output: from.1.into(),
      to_instance: to.0.into(),
      to_input: to.1.into(),
      kind: ConnectionKind::Direct,
    }
  }

  /// Create an iteration-to-reduce connection.
  pub fn iteration_to_reduce(
    connection_id: impl Into<String>,
    from: (impl Into<String>, impl Into<String>),
    to: (impl Into<String>, impl Into<String>),
  ) -> Self {
    Self {
      kind: ConnectionKind::IterationToReduce,
      ..Self::direct(connection_id, from, to)
    }
  }
}
