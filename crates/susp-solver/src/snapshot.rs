//! Opaque solver state for persistence and undo
//!
//! Keys are `"index@groupIndex"`: the position of a variable (or constraint)
//! inside its group, then the group index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::builder::ConstraintGraph;
use crate::constraint::ConstraintState;
use crate::error::{SolverError, SolverResult};
use crate::variable::VariableState;

/// Saved variable and constraint state of every group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub dof_state: BTreeMap<String, VariableState>,
    pub constraints_state: BTreeMap<String, ConstraintState>,
}

pub fn snapshot_key(index: usize, group: usize) -> String {
    format!("{index}@{group}")
}

impl Snapshot {
    /// Capture the current state of `graph`
    pub fn capture(graph: &ConstraintGraph) -> Self {
        let mut snapshot = Self::default();
        for (g, group) in graph.groups.iter().enumerate() {
            for (i, var) in group.variables.iter().enumerate() {
                snapshot
                    .dof_state
                    .insert(snapshot_key(i, g), graph.variables[var.0].save_state());
            }
            for (i, constraint) in group.constraints.iter().enumerate() {
                snapshot.constraints_state.insert(
                    snapshot_key(i, g),
                    graph.constraints[constraint.0].as_equations().save_state(),
                );
            }
        }
        snapshot
    }

    /// Capture only one group
    pub fn capture_group(graph: &ConstraintGraph, group: usize) -> Self {
        let mut snapshot = Self::capture(graph);
        let suffix = format!("@{group}");
        snapshot.dof_state.retain(|k, _| k.ends_with(&suffix));
        snapshot.constraints_state.retain(|k, _| k.ends_with(&suffix));
        snapshot
    }

    /// Write the saved state back. Every key must name an existing slot.
    pub fn restore(&self, graph: &mut ConstraintGraph) -> SolverResult<()> {
        for (key, state) in &self.dof_state {
            let (i, g) = parse_key(key)?;
            let var = graph
                .groups
                .get(g)
                .and_then(|group| group.variables.get(i))
                .ok_or_else(|| SolverError::SnapshotMismatch(format!("no variable at {key}")))?;
            graph.variables[var.0].restore_state(state)?;
        }
        for (key, state) in &self.constraints_state {
            let (i, g) = parse_key(key)?;
            let constraint = graph
                .groups
                .get(g)
                .and_then(|group| group.constraints.get(i))
                .ok_or_else(|| SolverError::SnapshotMismatch(format!("no constraint at {key}")))?;
            graph.constraints[constraint.0]
                .as_equations_mut()
                .restore_state(state)?;
        }
        Ok(())
    }
}

fn parse_key(key: &str) -> SolverResult<(usize, usize)> {
    key.split_once('@')
        .and_then(|(i, g)| Some((i.parse().ok()?, g.parse().ok()?)))
        .ok_or_else(|| SolverError::SnapshotMismatch(format!("malformed key {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(snapshot_key(3, 1), "3@1");
        assert_eq!(parse_key("12@0").unwrap(), (12, 0));
        assert!(parse_key("12").is_err());
        assert!(parse_key("a@0").is_err());
    }

    #[test]
    fn test_serde_is_opaque_value() {
        let mut snapshot = Snapshot::default();
        snapshot
            .dof_state
            .insert(snapshot_key(0, 0), VariableState::Scalar { value: 1.5 });
        snapshot
            .constraints_state
            .insert(snapshot_key(0, 0), ConstraintState::Offset { dl: -2.0 });
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
        let text = ron::to_string(&snapshot).unwrap();
        assert_eq!(ron::from_str::<Snapshot>(&text).unwrap(), snapshot);
    }
}
