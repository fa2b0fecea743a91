//! Three-way comparison of declared, last-applied and live attributes.
//!
//! Every field whose three values are not all equal yields one
//! [`Divergence`]. Fields are visited in lexical order so the output is
//! deterministic. Absent fields compare as `None`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::resource::{
    AttributeValue, Attributes, DeclaredResource, LiveObservation, ProviderRefs, ResourceRecord,
    references_in,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftClass {
    NoDrift,
    ExternalDrift,
    ConfigDrift,
    ConflictingDrift,
}

impl DriftClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftClass::NoDrift => "no_drift",
            DriftClass::ExternalDrift => "external_drift",
            DriftClass::ConfigDrift => "config_drift",
            DriftClass::ConflictingDrift => "conflicting_drift",
        }
    }
}

impl std::fmt::Display for DriftClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify one field. Total over every triple of values.
///
/// When declared and live agree but both moved away from the snapshot, the
/// change has already landed and the field is `NoDrift`.
pub fn classify(
    declared: Option<&AttributeValue>,
    applied: Option<&AttributeValue>,
    live: Option<&AttributeValue>,
) -> DriftClass {
    let live_matches_applied = live == applied;
    let declared_matches_applied = declared == applied;

    match (live_matches_applied, declared_matches_applied) {
        (true, true) => DriftClass::NoDrift,
        (true, false) => DriftClass::ConfigDrift,
        (false, true) => DriftClass::ExternalDrift,
        (false, false) if declared == live => DriftClass::NoDrift,
        (false, false) => DriftClass::ConflictingDrift,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Divergence {
    pub resource_id: String,
    pub field: String,
    pub declared_value: Option<AttributeValue>,
    pub applied_value: Option<AttributeValue>,
    pub live_value: Option<AttributeValue>,
    pub classification: DriftClass,
}

/// Compare the three attribute maps of one resource.
pub fn diff_attributes(
    resource_id: &str,
    declared: &Attributes,
    applied: &Attributes,
    live: &Attributes,
) -> Vec<Divergence> {
    let fields: BTreeSet<&str> = declared
        .keys()
        .chain(applied.keys())
        .chain(live.keys())
        .map(String::as_str)
        .collect();

    fields
        .into_iter()
        .filter_map(|field| {
            let d = declared.get(field);
            let a = applied.get(field);
            let l = live.get(field);
            if d == a && a == l {
                return None;
            }
            Some(Divergence {
                resource_id: resource_id.to_string(),
                field: field.to_string(),
                declared_value: d.cloned(),
                applied_value: a.cloned(),
                live_value: l.cloned(),
                classification: classify(d, a, l),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "divergences", rename_all = "snake_case")]
pub enum DiffOutcome {
    InSync,
    Drifted(Vec<Divergence>),
    /// A record exists but the provider no longer knows the resource.
    Missing,
    /// Declared but never applied.
    Unmanaged,
    /// Recorded but no longer declared.
    Orphaned,
}

/// Per-resource result of the diff pass; the planner's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceDiff {
    pub resource_id: String,
    pub resource_type: String,
    pub depends_on: BTreeSet<String>,
    pub outcome: DiffOutcome,
}

impl ResourceDiff {
    /// References in the declared and last-applied values are resolved
    /// through `refs` first, since providers report the referenced object's
    /// provider ref rather than a resource id.
    pub fn compare(
        declared: &DeclaredResource,
        record: &ResourceRecord,
        live: &LiveObservation,
        refs: &ProviderRefs,
    ) -> Self {
        let divergences = diff_attributes(
            &declared.id,
            &refs.resolve(&declared.attributes),
            &refs.resolve(&record.last_applied_attributes),
            &live.observed_attributes,
        );
        let outcome = if divergences.is_empty() {
            DiffOutcome::InSync
        } else {
            DiffOutcome::Drifted(divergences)
        };
        Self {
            resource_id: declared.id.clone(),
            resource_type: declared.resource_type.clone(),
            depends_on: declared.depends_on(),
            outcome,
        }
    }

    pub fn missing(declared: &DeclaredResource) -> Self {
        Self {
            resource_id: declared.id.clone(),
            resource_type: declared.resource_type.clone(),
            depends_on: declared.depends_on(),
            outcome: DiffOutcome::Missing,
        }
    }

    pub fn unmanaged(declared: &DeclaredResource) -> Self {
        Self {
            resource_id: declared.id.clone(),
            resource_type: declared.resource_type.clone(),
            depends_on: declared.depends_on(),
            outcome: DiffOutcome::Unmanaged,
        }
    }

    /// Dependencies of an orphan come from what was last declared for it.
    pub fn orphaned(record: &ResourceRecord) -> Self {
        Self {
            resource_id: record.id.clone(),
            resource_type: record.resource_type.clone(),
            depends_on: references_in(&record.declared_attributes),
            outcome: DiffOutcome::Orphaned,
        }
    }

    pub fn divergences(&self) -> &[Divergence] {
        match &self.outcome {
            DiffOutcome::Drifted(divergences) => divergences,
            _ => &[],
        }
    }

    pub fn has_conflict(&self) -> bool {
        self.divergences()
            .iter()
            .any(|d| d.classification == DriftClass::ConflictingDrift)
    }

    pub fn is_in_sync(&self) -> bool {
        matches!(self.outcome, DiffOutcome::InSync)
    }
}

/// Per-resource outcome for a declared resource, given its snapshot record
/// and what the provider returned (`None` when the provider does not know it).
pub fn diff_resource(
    declared: &DeclaredResource,
    record: Option<&ResourceRecord>,
    live: Option<&LiveObservation>,
    refs: &ProviderRefs,
) -> ResourceDiff {
    match (record, live) {
        (None, _) => ResourceDiff::unmanaged(declared),
        (Some(_), None) => ResourceDiff::missing(declared),
        (Some(record), Some(live)) => ResourceDiff::compare(declared, record, live, refs),
    }
}
