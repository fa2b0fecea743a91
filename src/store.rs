//! Persistence for last-applied resource records, scoped by partition.

mod file;
mod memory;

pub use file::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

use thiserror::Error;

use crate::resource::ResourceRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource '{resource_id}' not found in partition '{partition}'")]
    NotFound {
        partition: String,
        resource_id: String,
    },

    #[error("invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait SnapshotStore: Send + Sync {
    fn load(&self, partition: &str, resource_id: &str) -> Result<ResourceRecord, StoreError>;

    /// Insert or replace the record with the same id.
    fn save(&self, partition: &str, record: &ResourceRecord) -> Result<(), StoreError>;

    /// All records of a partition, ordered by id.
    fn list(&self, partition: &str) -> Result<Vec<ResourceRecord>, StoreError>;

    fn remove(&self, partition: &str, resource_id: &str) -> Result<(), StoreError>;
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    if matches!(id, "" | "." | "..") {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

fn not_found(partition: &str, resource_id: &str) -> StoreError {
    StoreError::NotFound {
        partition: partition.to_string(),
        resource_id: resource_id.to_string(),
    }
}
