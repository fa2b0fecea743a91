//! Terraform state parser used to seed the snapshot store.
//!
//! Parses tfstate v4 documents. Every managed resource instance becomes a
//! [`ResourceRecord`] whose declared and last-applied attributes are the
//! attributes Terraform recorded, and whose provider ref is the instance's
//! `id` attribute.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::resource::{AttributeValue, Attributes, ResourceRecord};

pub const SUPPORTED_VERSION: u32 = 4;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unsupported tfstate version {0} (expected 4)")]
    UnsupportedVersion(u32),
    #[error("invalid tfstate: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cannot read tfstate: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
pub struct TerraformState {
    pub version: u32,
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub lineage: String,
    #[serde(default)]
    pub resources: Vec<StateResource>,
}

#[derive(Debug, Deserialize)]
pub struct StateResource {
    #[serde(default)]
    pub module: Option<String>,
    pub mode: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    #[serde(default)]
    pub instances: Vec<StateInstance>,
}

#[derive(Debug, Deserialize)]
pub struct StateInstance {
    #[serde(default)]
    pub index_key: Option<serde_json::Value>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl TerraformState {
    pub fn parse(json: &str) -> Result<Self, StateError> {
        let state: TerraformState = serde_json::from_str(json)?;
        if state.version != SUPPORTED_VERSION {
            return Err(StateError::UnsupportedVersion(state.version));
        }
        Ok(state)
    }

    pub fn from_path(path: &Path) -> Result<Self, StateError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Records for every managed instance that has an `id`.
    pub fn records(&self) -> Vec<ResourceRecord> {
        let mut records = Vec::new();
        for resource in self.resources.iter().filter(|r| r.mode == "managed") {
            for instance in &resource.instances {
                let address = resource.address(instance.index_key.as_ref());
                let Some(AttributeValue::String(id)) = instance.attributes.get("id") else {
                    tracing::warn!(%address, "instance has no string id, skipping");
                    continue;
                };
                records.push(ResourceRecord {
                    id: address,
                    resource_type: resource.type_.clone(),
                    provider_ref: id.clone(),
                    declared_attributes: instance.attributes.clone(),
                    last_applied_attributes: instance.attributes.clone(),
                });
            }
        }
        records
    }
}

impl StateResource {
    /// Terraform-style address, e.g. `module.net.aws_subnet.private["a"]`.
    pub fn address(&self, index_key: Option<&serde_json::Value>) -> String {
        let mut address = match &self.module {
            Some(module) => format!("{}.{}.{}", module, self.type_, self.name),
            None => format!("{}.{}", self.type_, self.name),
        };
        match index_key {
            Some(serde_json::Value::Number(n)) => address.push_str(&format!("[{n}]")),
            Some(serde_json::Value::String(s)) => {
                address.push('[');
                address.push_str(&quote_key(s));
                address.push(']');
            }
            _ => {}
        }
        address
    }
}

/// Quote a string index key with HCL escapes, as Terraform prints it in
/// addresses. Template introducers (`${`, `%{`) are doubled.
fn quote_key(key: &str) -> String {
    let mut quoted = String::with_capacity(key.len() + 2);
    quoted.push('"');
    let mut chars = key.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '$' | '%' => {
                quoted.push(c);
                if chars.peek() == Some(&'{') {
                    quoted.push(c);
                }
            }
            c if c.is_control() || (c.is_whitespace() && c != ' ') => {
                let code = u32::from(c);
                if code < 0x10000 {
                    quoted.push_str(&format!("\\u{code:04x}"));
                } else {
                    quoted.push_str(&format!("\\U{code:08x}"));
                }
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
