use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{SnapshotStore, StoreError, not_found, validate_id};
use crate::resource::ResourceRecord;

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    partitions: Mutex<HashMap<String, BTreeMap<String, ResourceRecord>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn partitions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, ResourceRecord>>> {
        self.partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, partition: &str, resource_id: &str) -> Result<ResourceRecord, StoreError> {
        self.partitions()
            .get(partition)
            .and_then(|records| records.get(resource_id))
            .cloned()
            .ok_or_else(|| not_found(partition, resource_id))
    }

    fn save(&self, partition: &str, record: &ResourceRecord) -> Result<(), StoreError> {
        validate_id(partition)?;
        validate_id(&record.id)?;
        self.partitions()
            .entry(partition.to_string())
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn list(&self, partition: &str) -> Result<Vec<ResourceRecord>, StoreError> {
        Ok(self
            .partitions()
            .get(partition)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn remove(&self, partition: &str, resource_id: &str) -> Result<(), StoreError> {
        self.partitions()
            .get_mut(partition)
            .and_then(|records| records.remove(resource_id))
            .map(|_| ())
            .ok_or_else(|| not_found(partition, resource_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Attributes;

    fn record(id: &str) -> ResourceRecord {
        ResourceRecord {
            id: id.to_string(),
            resource_type: "instance".to_string(),
            provider_ref: format!("ref-{id}"),
            declared_attributes: Attributes::new(),
            last_applied_attributes: Attributes::new(),
        }
    }

    #[test]
    fn test_save_load_remove() {
        let store = MemorySnapshotStore::new();
        store.save("prod", &record("web")).unwrap();

        assert_eq!(store.load("prod", "web").unwrap().provider_ref, "ref-web");
        assert!(matches!(
            store.load("staging", "web"),
            Err(StoreError::NotFound { .. })
        ));

        store.remove("prod", "web").unwrap();
        assert!(matches!(
            store.remove("prod", "web"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_list_is_sorted() {
        let store = MemorySnapshotStore::new();
        for id in ["c", "a", "b"] {
            store.save("prod", &record(id)).unwrap();
        }
        let ids: Vec<_> = store
            .list("prod")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(store.list("empty").unwrap().is_empty());
    }

    #[test]
    fn test_dot_ids_rejected() {
        let store = MemorySnapshotStore::new();
        assert!(matches!(
            store.save("..", &record("web")),
            Err(StoreError::InvalidId(_))
        ));
        assert!(matches!(
            store.save("prod", &record(".")),
            Err(StoreError::InvalidId(_))
        ));
        assert!(store.list("..").unwrap().is_empty());
    }
}
