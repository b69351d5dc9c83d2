//! Rank propagation and cycle detection.
//!
//! Every task gets an integer rank equal to its longest dependency chain from
//! a source (a task with no incoming direct connections). Ranks are advisory:
//! they seed the scheduler's readiness order and detect cycles; dependency
//! gating itself is enforced purely by the prerequisite sets.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use weir_workflow::ConnectionKind;

use crate::task::{ConnectionRef, TaskId, TaskRef};

#[derive(Debug, Error)]
pub enum RankError {
  #[error("dependency cycle detected at task '{task}'")]
  Cycle { task: String },
}

/// Assign ranks to `tasks` connected by `connections`.
///
/// Only direct connections whose endpoints are both in `tasks` contribute
/// edges; iteration-to-reduce connections never propagate rank (the reduce
/// side's readiness depends on the whole iteration set, not one branch).
/// Containers call this on their own child set, independently of the parent
/// graph's ranks.
pub fn propagate_ranks(
  tasks: &[TaskRef],
  connections: &[ConnectionRef],
) -> Result<(), RankError> {
  let members: HashSet<TaskId> = tasks.iter().map(|t| t.id()).collect();

  let mut successors: HashMap<TaskId, Vec<TaskRef>> = HashMap::new();
  let mut has_incoming: HashSet<TaskId> = HashSet::new();
  for connection in connections {
    if connection.kind() != ConnectionKind::Direct {
      continue;
    }
    let (Some(from), Some(to)) = (connection.from_task(), connection.to_task()) else {
      continue;
    };
    if !members.contains(&from.id()) || !members.contains(&to.id()) {
      continue;
    }
    has_incoming.insert(to.id());
    successors.entry(from.id()).or_default().push(to);
  }

  let mut path = Vec::new();
  for task in tasks.iter().filter(|t| !has_incoming.contains(&t.id())) {
    assign(task, 1, &mut path, &successors)?;
  }

  // A cycle with no path from any source is never reached above; walking from
  // the still-unranked tasks finds it.
  for task in tasks {
    if task.rank() == 0 {
      assign(task, 1, &mut path, &successors)?;
    }
  }

  Ok(())
}

fn assign(
  task: &TaskRef,
  rank: u32,
  path: &mut Vec<TaskId>,
  successors: &HashMap<TaskId, Vec<TaskRef>>,
) -> Result<(), RankError> {
  if path.contains(&task.id()) {
    return Err(RankError::Cycle {
      task: task.name().to_string(),
    });
  }
  if !task.raise_rank(rank) {
    return Ok(());
  }
  path.push(task.id());
  if let Some(next) = successors.get(&task.id()) {
    for successor in next {
      assign(successor, rank + 1, path, successors)?;
    }
  }
  path.pop();
  Ok(())
}
