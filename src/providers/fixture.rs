//! Provider backed by a JSON document of live attributes.
//!
//! The document maps provider refs to attribute objects:
//! `{ "vol-1": { "size": 10 }, "i-1": { ... } }`. Applied changes mutate the
//! in-memory copy only.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Change, Provider, ProviderError};
use crate::plan::ActionKind;
use crate::resource::{Attributes, LiveObservation};

#[derive(Debug, Default)]
pub struct FixtureProvider {
    resources: Mutex<BTreeMap<String, Attributes>>,
}

impl FixtureProvider {
    pub fn new(resources: BTreeMap<String, Attributes>) -> Self {
        Self {
            resources: Mutex::new(resources),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ProviderError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            ProviderError::Config(format!("cannot read fixture {}: {}", path.display(), e))
        })?;
        let resources = serde_json::from_str(&json).map_err(|e| {
            ProviderError::Config(format!("invalid fixture {}: {}", path.display(), e))
        })?;
        Ok(Self::new(resources))
    }

    /// Current attributes of one resource.
    pub fn get(&self, provider_ref: &str) -> Option<Attributes> {
        self.resources().get(provider_ref).cloned()
    }

    pub fn set(&self, provider_ref: &str, attributes: Attributes) {
        self.resources().insert(provider_ref.to_string(), attributes);
    }

    fn resources(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Attributes>> {
        self.resources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Provider for FixtureProvider {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch(&self, provider_ref: &str) -> Result<LiveObservation, ProviderError> {
        self.get(provider_ref)
            .map(|attrs| LiveObservation::now(provider_ref, attrs))
            .ok_or_else(|| ProviderError::NotFound(provider_ref.to_string()))
    }

    async fn apply(&self, change: &Change) -> Result<(), ProviderError> {
        let mut resources = self.resources();
        match change.kind {
            ActionKind::Create | ActionKind::Recreate => {
                resources.insert(change.provider_ref.clone(), change.attributes.clone());
            }
            ActionKind::Update | ActionKind::Revert => {
                let current = resources
                    .get_mut(&change.provider_ref)
                    .ok_or_else(|| ProviderError::NotFound(change.provider_ref.clone()))?;
                for (field, value) in &change.attributes {
                    current.insert(field.clone(), value.clone());
                }
                for field in &change.removed {
                    current.remove(field);
                }
            }
            ActionKind::Delete => {
                resources.remove(&change.provider_ref);
            }
            ActionKind::Refresh => {}
        }
        Ok(())
    }
}
