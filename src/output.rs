//! Human-readable rendering of reconciliation reports.

use std::collections::BTreeMap;

use tabled::settings::Style;
use tabled::{Table, Tabled};
use termtree::Tree;

use crate::diff::{DiffOutcome, Divergence, ResourceDiff};
use crate::plan::ActionKind;
use crate::reconcile::ReconcileReport;
use crate::resource::AttributeValue;

#[derive(Tabled)]
struct DivergenceRow {
    #[tabled(rename = "RESOURCE")]
    resource: String,
    #[tabled(rename = "FIELD")]
    field: String,
    #[tabled(rename = "DECLARED")]
    declared: String,
    #[tabled(rename = "APPLIED")]
    applied: String,
    #[tabled(rename = "LIVE")]
    live: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

fn cell(value: Option<&AttributeValue>) -> String {
    value.map_or_else(|| "-".to_string(), ToString::to_string)
}

impl From<&Divergence> for DivergenceRow {
    fn from(d: &Divergence) -> Self {
        Self {
            resource: d.resource_id.clone(),
            field: d.field.clone(),
            declared: cell(d.declared_value.as_ref()),
            applied: cell(d.applied_value.as_ref()),
            live: cell(d.live_value.as_ref()),
            status: d.classification.to_string(),
        }
    }
}

fn whole_resource_row(diff: &ResourceDiff, status: &str) -> DivergenceRow {
    DivergenceRow {
        resource: diff.resource_id.clone(),
        field: "*".to_string(),
        declared: "-".to_string(),
        applied: "-".to_string(),
        live: "-".to_string(),
        status: status.to_string(),
    }
}

/// One row per divergent field, plus one row per missing, unmanaged or
/// orphaned resource. `None` when everything is in sync.
pub fn divergence_table(diffs: &[ResourceDiff]) -> Option<String> {
    let mut rows = Vec::new();
    for diff in diffs {
        match &diff.outcome {
            DiffOutcome::InSync => {}
            DiffOutcome::Drifted(divergences) => {
                rows.extend(divergences.iter().map(DivergenceRow::from))
            }
            DiffOutcome::Missing => rows.push(whole_resource_row(diff, "missing")),
            DiffOutcome::Unmanaged => rows.push(whole_resource_row(diff, "unmanaged")),
            DiffOutcome::Orphaned => rows.push(whole_resource_row(diff, "orphaned")),
        }
    }

    if rows.is_empty() {
        return None;
    }
    Some(Table::new(rows).with(Style::sharp()).to_string())
}

/// The ordered plan as a tree: actions with their fields, then anything held
/// for review, reported, skipped or failed.
pub fn plan_tree(report: &ReconcileReport) -> Tree<String> {
    let mut root = Tree::new(format!("plan for partition '{}'", report.partition));

    for (step, action) in report.plan.actions.iter().enumerate() {
        let mut node = Tree::new(format!(
            "{}. {} {} ({})",
            step + 1,
            action.kind,
            action.resource_id,
            action.resource_type
        ));
        node.extend(action.fields.iter().cloned());
        root.push(node);
    }

    if !report.plan.review.is_empty() {
        let mut review = Tree::new("held for review".to_string());
        for item in &report.plan.review {
            let mut node = Tree::new(item.resource_id.clone());
            node.extend(item.conflicts.iter().map(describe));
            review.push(node);
        }
        root.push(review);
    }

    if !report.plan.reported.is_empty() {
        let mut reported = Tree::new("external drift (reported only)".to_string());
        reported.extend(
            report
                .plan
                .reported
                .iter()
                .map(|d| format!("{}: {}", d.resource_id, describe(d))),
        );
        root.push(reported);
    }

    if !report.skipped.is_empty() {
        let mut skipped = Tree::new("skipped (dependency failed)".to_string());
        skipped.extend(report.skipped.iter().cloned());
        root.push(skipped);
    }

    if !report.failures.is_empty() {
        let mut failed = Tree::new("failed".to_string());
        failed.extend(report.failures.iter().map(|f| {
            format!(
                "{} after {} attempt(s): {}",
                f.resource_id, f.attempts, f.message
            )
        }));
        root.push(failed);
    }

    root
}

fn describe(d: &Divergence) -> String {
    format!(
        "{}: declared {}, applied {}, live {}",
        d.field,
        cell(d.declared_value.as_ref()),
        cell(d.applied_value.as_ref()),
        cell(d.live_value.as_ref())
    )
}

/// One-line summary, e.g. `2 to create, 1 to revert, 1 held for review`.
pub fn summary(report: &ReconcileReport) -> String {
    if report.is_clean() {
        return "no changes; infrastructure matches the declarations".to_string();
    }

    let mut counts: BTreeMap<ActionKind, usize> = BTreeMap::new();
    for action in &report.plan.actions {
        *counts.entry(action.kind).or_default() += 1;
    }

    let mut parts: Vec<String> = counts
        .iter()
        .map(|(kind, n)| format!("{} to {}", n, kind))
        .collect();
    if !report.plan.review.is_empty() {
        parts.push(format!("{} held for review", report.plan.review.len()));
    }
    if !report.plan.reported.is_empty() {
        parts.push(format!("{} drift(s) reported", report.plan.reported.len()));
    }
    if !report.failures.is_empty() {
        parts.push(format!("{} failed", report.failures.len()));
    }
    parts.join(", ")
}
