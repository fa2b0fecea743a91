//! Turns classified diffs into an ordered list of corrective actions.
//!
//! Declared resources are ordered so that a resource's dependencies come
//! first (Kahn's algorithm, ties broken by id). Deletions of orphaned
//! records run last and in reverse dependency order, so dependents are
//! removed before the things they point at.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diff::{DiffOutcome, Divergence, DriftClass, ResourceDiff};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("dependency cycle detected among: {}", members.join(", "))]
    CycleDetected { members: Vec<String> },
}

/// What to do about fields that changed outside the tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalDriftPolicy {
    /// Write the declared values back.
    #[default]
    Revert,
    /// Report the drift and leave it alone.
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Create,
    Update,
    Revert,
    /// Snapshot-only: the live side already matches the declaration.
    Refresh,
    Recreate,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Revert => "revert",
            ActionKind::Refresh => "refresh",
            ActionKind::Recreate => "recreate",
            ActionKind::Delete => "delete",
        }
    }

    /// Whether the action writes to the provider.
    pub fn touches_provider(&self) -> bool {
        !matches!(self, ActionKind::Refresh)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PlannedAction {
    pub resource_id: String,
    pub resource_type: String,
    pub kind: ActionKind,
    /// Fields the action writes. Empty for whole-resource actions.
    pub fields: Vec<String>,
    pub depends_on: BTreeSet<String>,
}

/// A resource held back from automatic planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReviewItem {
    pub resource_id: String,
    pub conflicts: Vec<Divergence>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Plan {
    pub actions: Vec<PlannedAction>,
    pub review: Vec<ReviewItem>,
    /// External drift left alone under [`ExternalDriftPolicy::Report`].
    pub reported: Vec<Divergence>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.review.is_empty() && self.reported.is_empty()
    }

    pub fn position(&self, resource_id: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.resource_id == resource_id)
    }
}

/// Order resource ids so every dependency precedes its dependents.
///
/// References to ids outside `diffs` are ignored; a self-reference counts
/// as a cycle.
pub fn dependency_order(diffs: &[ResourceDiff]) -> Result<Vec<String>, PlanError> {
    let ids: BTreeSet<&str> = diffs.iter().map(|d| d.resource_id.as_str()).collect();

    let mut in_degree: BTreeMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for diff in diffs {
        for dep in &diff.depends_on {
            if let Some(&dep_id) = ids.get(dep.as_str()) {
                dependents.entry(dep_id).or_default().push(diff.resource_id.as_str());
                *in_degree.entry(diff.resource_id.as_str()).or_default() += 1;
            }
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = Vec::with_capacity(ids.len());

    while let Some(id) = ready.pop_first() {
        sorted.push(id.to_string());
        for &dependent in dependents.get(id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(dependent) {
                *deg -= 1;
                if *deg == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if sorted.len() != ids.len() {
        // Unsorted nodes include dependents of a cycle; report only the
        // nodes that lie on one.
        let members = in_degree
            .into_iter()
            .filter(|(id, deg)| *deg > 0 && on_cycle(id, &dependents))
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(PlanError::CycleDetected { members });
    }

    Ok(sorted)
}

/// Whether `start` can reach itself by following dependent edges.
fn on_cycle(start: &str, dependents: &BTreeMap<&str, Vec<&str>>) -> bool {
    let mut stack: Vec<&str> = dependents.get(start).cloned().unwrap_or_default();
    let mut seen = BTreeSet::new();
    while let Some(id) = stack.pop() {
        if id == start {
            return true;
        }
        if seen.insert(id) {
            stack.extend(dependents.get(id).into_iter().flatten().copied());
        }
    }
    false
}

pub fn plan(diffs: &[ResourceDiff], policy: ExternalDriftPolicy) -> Result<Plan, PlanError> {
    let order = dependency_order(diffs)?;
    let by_id: BTreeMap<&str, &ResourceDiff> =
        diffs.iter().map(|d| (d.resource_id.as_str(), d)).collect();

    let mut plan = Plan::default();
    let mut deletes = Vec::new();

    for id in &order {
        let Some(diff) = by_id.get(id.as_str()) else {
            continue;
        };

        let action = |kind, fields| PlannedAction {
            resource_id: diff.resource_id.clone(),
            resource_type: diff.resource_type.clone(),
            kind,
            fields,
            depends_on: diff.depends_on.clone(),
        };

        match &diff.outcome {
            DiffOutcome::InSync => {}
            DiffOutcome::Unmanaged => plan.actions.push(action(ActionKind::Create, Vec::new())),
            DiffOutcome::Missing => plan.actions.push(action(ActionKind::Recreate, Vec::new())),
            DiffOutcome::Orphaned => deletes.push(action(ActionKind::Delete, Vec::new())),
            DiffOutcome::Drifted(divergences) => {
                if diff.has_conflict() {
                    plan.review.push(ReviewItem {
                        resource_id: diff.resource_id.clone(),
                        conflicts: divergences
                            .iter()
                            .filter(|d| d.classification == DriftClass::ConflictingDrift)
                            .cloned()
                            .collect(),
                    });
                    continue;
                }
                if let Some((kind, fields)) = drift_action(divergences, policy, &mut plan.reported)
                {
                    plan.actions.push(action(kind, fields));
                }
            }
        }
    }

    deletes.reverse();
    plan.actions.extend(deletes);

    tracing::debug!(
        actions = plan.actions.len(),
        review = plan.review.len(),
        reported = plan.reported.len(),
        "plan computed"
    );

    Ok(plan)
}

/// Pick the action for a drifted resource without conflicts.
fn drift_action(
    divergences: &[Divergence],
    policy: ExternalDriftPolicy,
    reported: &mut Vec<Divergence>,
) -> Option<(ActionKind, Vec<String>)> {
    let mut fields = Vec::new();
    let mut config_drift = false;
    let mut reverting = false;

    for divergence in divergences {
        match divergence.classification {
            DriftClass::ConfigDrift => {
                config_drift = true;
                fields.push(divergence.field.clone());
            }
            DriftClass::ExternalDrift => match policy {
                ExternalDriftPolicy::Revert => {
                    reverting = true;
                    fields.push(divergence.field.clone());
                }
                ExternalDriftPolicy::Report => reported.push(divergence.clone()),
            },
            DriftClass::NoDrift => fields.push(divergence.field.clone()),
            DriftClass::ConflictingDrift => {}
        }
    }

    let kind = if config_drift {
        ActionKind::Update
    } else if reverting {
        ActionKind::Revert
    } else if !fields.is_empty() {
        ActionKind::Refresh
    } else {
        return None;
    };
    Some((kind, fields))
}
