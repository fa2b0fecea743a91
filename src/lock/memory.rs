use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{LockCoordinator, LockError, LockToken, not_holder, validate_partition};

/// Process-local coordinator. Only serialises callers that share the value.
#[derive(Debug, Default)]
pub struct MemoryLockCoordinator {
    tokens: Mutex<HashMap<String, LockToken>>,
}

impl MemoryLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockToken>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LockCoordinator for MemoryLockCoordinator {
    fn acquire(
        &self,
        partition_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockError> {
        validate_partition(partition_id)?;
        let mut tokens = self.tokens();
        if let Some(existing) = tokens.get(partition_id).filter(|t| t.is_valid()) {
            return Err(existing.held_error());
        }
        let token = LockToken::new(partition_id, holder_id, ttl);
        tokens.insert(partition_id.to_string(), token.clone());
        Ok(token)
    }

    fn renew(
        &self,
        partition_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockError> {
        let mut tokens = self.tokens();
        match tokens.get_mut(partition_id) {
            Some(token) if token.is_valid() && token.holder_id == holder_id => {
                *token = LockToken::new(partition_id, holder_id, ttl);
                Ok(token.clone())
            }
            _ => Err(not_holder(partition_id, holder_id)),
        }
    }

    fn release(&self, partition_id: &str, holder_id: &str) -> Result<(), LockError> {
        let mut tokens = self.tokens();
        let holds = tokens
            .get(partition_id)
            .is_some_and(|t| t.is_valid() && t.holder_id == holder_id);
        if !holds {
            return Err(not_holder(partition_id, holder_id));
        }
        tokens.remove(partition_id);
        Ok(())
    }

    fn current(&self, partition_id: &str) -> Result<Option<LockToken>, LockError> {
        Ok(self
            .tokens()
            .get(partition_id)
            .filter(|t| t.is_valid())
            .cloned())
    }

    fn force_release(&self, partition_id: &str) -> Result<Option<LockToken>, LockError> {
        Ok(self.tokens().remove(partition_id))
    }
}
