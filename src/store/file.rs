use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{SnapshotStore, StoreError, not_found, validate_id};
use crate::paths::encode_component;
use crate::resource::ResourceRecord;

/// One JSON file per record: `<root>/<partition>/<resource id>.json`.
///
/// Partition and resource ids are percent-encoded into file names, dots
/// included. Writes
/// go to a temporary file in the same directory and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn partition_dir(&self, partition: &str) -> PathBuf {
        self.root.join(encode_component(partition))
    }

    fn record_path(&self, partition: &str, resource_id: &str) -> PathBuf {
        self.partition_dir(partition)
            .join(format!("{}.json", encode_component(resource_id)))
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self, partition: &str, resource_id: &str) -> Result<ResourceRecord, StoreError> {
        validate_id(partition)?;
        validate_id(resource_id)?;
        match fs::read(self.record_path(partition, resource_id)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(partition, resource_id)),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, partition: &str, record: &ResourceRecord) -> Result<(), StoreError> {
        validate_id(partition)?;
        validate_id(&record.id)?;

        let dir = self.partition_dir(partition);
        fs::create_dir_all(&dir)?;

        let path = self.record_path(partition, &record.id);
        let tmp = dir.join(format!(".{}.json.tmp", encode_component(&record.id)));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(record)?)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        tracing::debug!(partition, resource_id = %record.id, "record saved");
        Ok(())
    }

    fn list(&self, partition: &str) -> Result<Vec<ResourceRecord>, StoreError> {
        validate_id(partition)?;
        let entries = match fs::read_dir(self.partition_dir(partition)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_record {
                continue;
            }
            let record: ResourceRecord = serde_json::from_slice(&fs::read(&path)?)?;
            records.push(record);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn remove(&self, partition: &str, resource_id: &str) -> Result<(), StoreError> {
        validate_id(partition)?;
        validate_id(resource_id)?;
        match fs::remove_file(self.record_path(partition, resource_id)) {
            Ok(()) => {
                tracing::debug!(partition, resource_id, "record removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(not_found(partition, resource_id)),
            Err(e) => Err(e.into()),
        }
    }
}
