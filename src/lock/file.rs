use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{LockCoordinator, LockError, LockToken, not_holder, validate_partition};
use crate::paths::encode_component;

/// Coordinator backed by token files in a shared directory.
///
/// Each partition has `<partition>.lock` holding the JSON token and a
/// `<partition>.lock.guard` file. Every read-check-write of the token runs
/// under an exclusive OS lock on the guard, which makes acquisition atomic
/// across processes on the same host or shared filesystem.
#[derive(Debug, Clone)]
pub struct FileLockCoordinator {
    dir: PathBuf,
}

impl FileLockCoordinator {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn token_path(&self, partition_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.lock", encode_component(partition_id)))
    }

    fn guard_path(&self, partition_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.lock.guard", encode_component(partition_id)))
    }

    /// Run `f` while holding the partition's guard lock.
    fn with_guard<T>(
        &self,
        partition_id: &str,
        f: impl FnOnce(&Path) -> Result<T, LockError>,
    ) -> Result<T, LockError> {
        validate_partition(partition_id)?;
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.guard_path(partition_id))?;
        guard.lock()?;
        let result = f(&self.token_path(partition_id));
        guard.unlock()?;
        result
    }
}

fn read_token(path: &Path) -> Result<Option<LockToken>, LockError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_token(path: &Path, token: &LockToken) -> Result<(), LockError> {
    let tmp = path.with_extension("lock.tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(&serde_json::to_vec_pretty(token)?)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_token(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl LockCoordinator for FileLockCoordinator {
    fn acquire(
        &self,
        partition_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockError> {
        self.with_guard(partition_id, |path| {
            if let Some(existing) = read_token(path)? {
                if existing.is_valid() {
                    return Err(existing.held_error());
                }
                tracing::debug!(
                    partition = partition_id,
                    stale_holder = %existing.holder_id,
                    "replacing expired lock token"
                );
            }
            let token = LockToken::new(partition_id, holder_id, ttl);
            write_token(path, &token)?;
            Ok(token)
        })
    }

    fn renew(
        &self,
        partition_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockError> {
        self.with_guard(partition_id, |path| match read_token(path)? {
            Some(token) if token.is_valid() && token.holder_id == holder_id => {
                let renewed = LockToken::new(partition_id, holder_id, ttl);
                write_token(path, &renewed)?;
                tracing::debug!(partition = partition_id, holder = holder_id, "lock renewed");
                Ok(renewed)
            }
            _ => Err(not_holder(partition_id, holder_id)),
        })
    }

    fn release(&self, partition_id: &str, holder_id: &str) -> Result<(), LockError> {
        self.with_guard(partition_id, |path| match read_token(path)? {
            Some(token) if token.is_valid() && token.holder_id == holder_id => {
                remove_token(path)?;
                tracing::info!(partition = partition_id, holder = holder_id, "lock released");
                Ok(())
            }
            _ => Err(not_holder(partition_id, holder_id)),
        })
    }

    fn current(&self, partition_id: &str) -> Result<Option<LockToken>, LockError> {
        self.with_guard(partition_id, |path| {
            Ok(read_token(path)?.filter(LockToken::is_valid))
        })
    }

    fn force_release(&self, partition_id: &str) -> Result<Option<LockToken>, LockError> {
        self.with_guard(partition_id, |path| {
            // A corrupt token is still removed.
            let existing = read_token(path).ok().flatten();
            remove_token(path)?;
            tracing::warn!(partition = partition_id, "lock force-released");
            Ok(existing)
        })
    }
}
