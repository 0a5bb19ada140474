//! Named mutual-exclusion lock over set-if-absent with TTL.
//!
//! `release` is an unconditional delete: anyone holding a [`Lock`] can release
//! any lock by name. Callers that need ownership checks use
//! [`Lock::acquire_owned`] together with [`Lock::release_if_owner`].
//!
//! Acquisition never retries. A `false` result means someone else holds the
//! lock; retry policy is up to the caller.

use std::sync::Arc;

use serde_json::Value;
use skein_store::AtomicScript;
use skein_store::AtomicStore;
use skein_store::StoreCommand;
use skein_store::StoreError;
use skein_store::Transaction;
use tracing::debug;

use crate::error::CoordinationError;
use crate::keys::KeySpace;

/// Lock handle bound to a store and namespace.
pub struct Lock<S: AtomicStore + ?Sized> {
    store: Arc<S>,
    keys: KeySpace,
}

impl<S: AtomicStore + ?Sized> Clone for Lock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
        }
    }
}

impl<S: AtomicStore + ?Sized> Lock<S> {
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Acquire `name` for `ttl_ms` (0 = no expiry) with a generated owner value.
    ///
    /// With `steal` the key is overwritten and the call always succeeds.
    pub async fn acquire(&self, name: &str, ttl_ms: u64, steal: bool) -> Result<bool, CoordinationError> {
        let owner = uuid::Uuid::new_v4().to_string();
        self.acquire_owned(name, &owner, ttl_ms, steal).await
    }

    /// Acquire `name`, storing `owner` as the holder.
    pub async fn acquire_owned(
        &self,
        name: &str,
        owner: &str,
        ttl_ms: u64,
        steal: bool,
    ) -> Result<bool, CoordinationError> {
        let key = self.keys.lock(name);
        let ttl = (ttl_ms > 0).then_some(ttl_ms);
        let acquired = if steal {
            self.store.command(StoreCommand::set(&key, owner, ttl)).await?;
            true
        } else {
            self.store.command(StoreCommand::set_if_absent(&key, owner, ttl)).await?.into_bool()?
        };
        debug!(lock = %name, owner = %owner, ttl_ms, steal, acquired, "lock acquire");
        Ok(acquired)
    }

    /// Delete the lock regardless of who holds it. Returns whether it existed.
    pub async fn release(&self, name: &str) -> Result<bool, CoordinationError> {
        let released = self.store.command(StoreCommand::delete(self.keys.lock(name))).await?.into_bool()?;
        debug!(lock = %name, released, "lock release");
        Ok(released)
    }

    /// Current owner value, if the lock is held.
    pub async fn holder(&self, name: &str) -> Result<Option<String>, CoordinationError> {
        Ok(self.store.command(StoreCommand::get(self.keys.lock(name))).await?.into_value()?)
    }

    /// Delete the lock only if `owner` still holds it.
    pub async fn release_if_owner(&self, name: &str, owner: &str) -> Result<bool, CoordinationError> {
        let script = CompareAndDelete {
            key: self.keys.lock(name),
            expected: owner.to_string(),
        };
        let result = self.store.execute(&script).await?;
        let released = result.as_bool().ok_or_else(|| CoordinationError::UnexpectedScriptResult {
            script: script.name().to_string(),
            reason: format!("expected bool, got {result}"),
        })?;
        debug!(lock = %name, owner = %owner, released, "lock release_if_owner");
        Ok(released)
    }
}

struct CompareAndDelete {
    key: String,
    expected: String,
}

impl AtomicScript for CompareAndDelete {
    fn name(&self) -> &'static str {
        "lock_compare_and_delete"
    }

    fn run(&self, txn: &mut dyn Transaction) -> Result<Value, StoreError> {
        match txn.get(&self.key)? {
            Some(current) if current == self.expected => Ok(Value::Bool(txn.delete(&self.key)?)),
            _ => Ok(Value::Bool(false)),
        }
    }
}
