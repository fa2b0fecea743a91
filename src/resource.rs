use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DriftError;
use crate::plan::ExternalDriftPolicy;
use crate::retry::RetryPolicy;

/// Key used to mark a reference to another resource in JSON: `{"$ref": "<id>"}`.
pub const REFERENCE_KEY: &str = "$ref";

/// A typed attribute value. JSON is the interchange form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
    Reference(String),
}

pub type Attributes = BTreeMap<String, AttributeValue>;

impl AttributeValue {
    /// Ids of every resource this value references, nested values included.
    pub fn references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            AttributeValue::Reference(id) => {
                out.insert(id.clone());
            }
            AttributeValue::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            AttributeValue::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
            _ => {}
        }
    }

    /// Replace each reference with the provider ref of the resource it
    /// points at. References to ids `refs` does not know are kept.
    pub fn resolve(&self, refs: &ProviderRefs) -> AttributeValue {
        match self {
            AttributeValue::Reference(id) => match refs.get(id) {
                Some(provider_ref) => AttributeValue::String(provider_ref.to_string()),
                None => self.clone(),
            },
            AttributeValue::List(items) => {
                AttributeValue::List(items.iter().map(|item| item.resolve(refs)).collect())
            }
            AttributeValue::Map(entries) => AttributeValue::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.resolve(refs)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttributeValue::Null,
            serde_json::Value::Bool(b) => AttributeValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => AttributeValue::Int(i),
                None => AttributeValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => AttributeValue::String(s),
            serde_json::Value::Array(items) => {
                AttributeValue::List(items.into_iter().map(AttributeValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(target)) = map.get(REFERENCE_KEY) {
                        return AttributeValue::Reference(target.clone());
                    }
                }
                AttributeValue::Map(
                    map.into_iter()
                        .map(|(k, v)| (k, AttributeValue::from(v)))
                        .collect(),
                )
            }
        }
    }
}

impl From<AttributeValue> for serde_json::Value {
    fn from(value: AttributeValue) -> Self {
        match value {
            AttributeValue::Null => serde_json::Value::Null,
            AttributeValue::Bool(b) => serde_json::Value::Bool(b),
            AttributeValue::Int(i) => serde_json::Value::from(i),
            AttributeValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttributeValue::String(s) => serde_json::Value::String(s),
            AttributeValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            AttributeValue::Map(entries) => serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
            AttributeValue::Reference(target) => {
                let mut map = serde_json::Map::new();
                map.insert(REFERENCE_KEY.to_string(), serde_json::Value::String(target));
                serde_json::Value::Object(map)
            }
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => write!(f, "{s}"),
            AttributeValue::Reference(target) => write!(f, "ref({target})"),
            other => write!(f, "{}", serde_json::Value::from(other.clone())),
        }
    }
}

/// References found anywhere in an attribute map.
pub fn references_in(attributes: &Attributes) -> BTreeSet<String> {
    attributes
        .values()
        .flat_map(AttributeValue::references)
        .collect()
}

/// Resource id to provider ref, for resolving references before values are
/// compared with live attributes or sent to a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderRefs(BTreeMap<String, String>);

impl ProviderRefs {
    /// Recorded refs win, since they name the object that exists now.
    /// Declarations cover resources that have not been created yet.
    pub fn new<'a>(
        declared: &[DeclaredResource],
        records: impl IntoIterator<Item = &'a ResourceRecord>,
    ) -> Self {
        let mut refs: BTreeMap<String, String> = declared
            .iter()
            .map(|d| (d.id.clone(), d.provider_ref.clone()))
            .collect();
        for record in records {
            refs.insert(record.id.clone(), record.provider_ref.clone());
        }
        Self(refs)
    }

    pub fn get(&self, resource_id: &str) -> Option<&str> {
        self.0.get(resource_id).map(String::as_str)
    }

    pub fn resolve(&self, attributes: &Attributes) -> Attributes {
        attributes
            .iter()
            .map(|(field, value)| (field.clone(), value.resolve(self)))
            .collect()
    }
}

/// What the snapshot store remembers about one managed resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceRecord {
    pub id: String,
    pub resource_type: String,
    pub provider_ref: String,
    #[serde(default)]
    pub declared_attributes: Attributes,
    #[serde(default)]
    pub last_applied_attributes: Attributes,
}

/// A resource as written in the declaration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DeclaredResource {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub provider_ref: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl DeclaredResource {
    pub fn depends_on(&self) -> BTreeSet<String> {
        references_in(&self.attributes)
    }
}

#[derive(Debug, Deserialize)]
struct DeclarationDocument {
    #[serde(default)]
    resources: Vec<DeclaredResource>,
}

/// Parse a declaration document and reject duplicate ids.
pub fn parse_declarations(json: &str) -> Result<Vec<DeclaredResource>, DriftError> {
    let doc: DeclarationDocument = serde_json::from_str(json)
        .map_err(|e| DriftError::Config(format!("invalid declaration document: {e}")))?;
    validate_declarations(&doc.resources)?;
    Ok(doc.resources)
}

pub fn load_declarations(path: &Path) -> Result<Vec<DeclaredResource>, DriftError> {
    let json = std::fs::read_to_string(path)?;
    parse_declarations(&json)
}

pub fn validate_declarations(resources: &[DeclaredResource]) -> Result<(), DriftError> {
    let mut seen = HashSet::new();
    for resource in resources {
        if resource.id.is_empty() {
            return Err(DriftError::Config("resource id must not be empty".to_string()));
        }
        if !seen.insert(resource.id.as_str()) {
            return Err(DriftError::Config(format!(
                "duplicate resource id '{}'",
                resource.id
            )));
        }
    }
    Ok(())
}

/// Attribute values reported by a provider for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LiveObservation {
    pub provider_ref: String,
    pub observed_attributes: Attributes,
    pub observed_at: DateTime<Utc>,
}

impl LiveObservation {
    pub fn now(provider_ref: impl Into<String>, observed_attributes: Attributes) -> Self {
        Self {
            provider_ref: provider_ref.into(),
            observed_attributes,
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub holder_id: String,
    pub lock_ttl: Duration,
    pub lock_timeout: Duration,
    /// Backoff between lock attempts while another holder is active.
    pub lock_retry: RetryPolicy,
    /// Backoff for transient provider errors.
    pub retry: RetryPolicy,
    pub concurrency: usize,
    pub external_drift: ExternalDriftPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            holder_id: format!("driftguard-{}", uuid::Uuid::new_v4()),
            lock_ttl: Duration::from_secs(15 * 60),
            lock_timeout: Duration::from_secs(30),
            lock_retry: RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
            },
            retry: RetryPolicy::default(),
            concurrency: 8,
            external_drift: ExternalDriftPolicy::Revert,
        }
    }
}
