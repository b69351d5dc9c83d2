//! Weir Workflow
//!
//! This crate provides the compiled workflow representation consumed by the
//! weir execution engine. A compiled workflow is a validated graph of
//! algorithm instances and typed connections, ready to be turned into
//! execution tasks.
//!
//! Key properties:
//! - Instance and slot references are validated (no dangling connections)
//! - Container membership is resolved and acyclic
//! - Direct connections never cross a container boundary; iteration-to-reduce
//!   connections are the one sanctioned crossing (container child to an
//!   outside reduce consumer)

mod connection;
mod error;
mod instance;
mod workflow;

pub use connection::{Connection, ConnectionKind};
pub use error::WorkflowError;
pub use instance::AlgoInstance;
pub use workflow::Workflow;
