//! Core traits for atomic store access.
//!
//! An [`AtomicStore`] offers two entry points: single-step [`StoreCommand`]s and
//! [`AtomicScript`]s, short multi-step procedures that the store runs as one
//! indivisible unit against a [`Transaction`]. Every mutation of shared
//! coordination state goes through one of these two calls; a read followed by a
//! separate write is never used for state other processes also mutate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::command::StoreCommand;
use crate::command::StoreResponse;
use crate::error::StoreError;
use crate::types::ScoredMember;

/// Synchronous view of the store inside an atomic unit.
///
/// Keys past their TTL read as absent. Operations on a key holding a different
/// kind of value fail with [`StoreError::WrongType`]. Ordered collections and
/// hashes left empty by a removal cease to exist.
pub trait Transaction {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a string value, replacing any previous value and TTL.
    fn set(&mut self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError>;

    /// Write only if the key is absent. Returns whether the write happened.
    fn set_if_absent(&mut self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<bool, StoreError>;

    fn delete(&mut self, key: &str) -> Result<bool, StoreError>;

    /// Refresh the TTL of an existing key. Returns false if the key is absent.
    fn expire(&mut self, key: &str, ttl_ms: u64) -> Result<bool, StoreError>;

    /// Atomic integer increment; an absent key counts as 0.
    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError>;

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Returns true if the field was newly created.
    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool, StoreError>;

    fn hgetall(&mut self, key: &str) -> Result<BTreeMap<String, String>, StoreError>;

    fn hdel(&mut self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Insert or re-score a member. Returns true if the member was new.
    fn zadd(&mut self, key: &str, member: &str, score: f64) -> Result<bool, StoreError>;

    fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    fn zrem(&mut self, key: &str, member: &str) -> Result<bool, StoreError>;

    fn zcard(&mut self, key: &str) -> Result<u64, StoreError>;

    /// Members with `min <= score <= max`, lowest score first.
    fn zrange_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<u32>,
    ) -> Result<Vec<ScoredMember>, StoreError>;

    /// Number of members with `min <= score <= max`.
    fn zcount(&mut self, key: &str, min: f64, max: f64) -> Result<u64, StoreError> {
        Ok(self.zrange_by_score(key, min, max, None)?.len() as u64)
    }

    /// Members by rank, inclusive on both ends; negative indices count from the end.
    fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<ScoredMember>, StoreError>;

    /// Remove members by rank, same index rules as [`Transaction::zrange`].
    fn zrem_range_by_rank(&mut self, key: &str, start: i64, stop: i64) -> Result<u64, StoreError>;
}

/// A multi-step procedure executed atomically by the store.
///
/// The result is a JSON value so that a networked store can ship it back over
/// the wire. If a script fails part-way, writes it already made are kept, the
/// same as scripted transactions on common key-value servers; scripts should
/// validate before they write.
pub trait AtomicScript: Send + Sync {
    /// Stable name used in logs and errors.
    fn name(&self) -> &'static str;

    fn run(&self, txn: &mut dyn Transaction) -> Result<Value, StoreError>;
}

/// Shared networked key-value store with atomic procedures.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Run a single primitive.
    async fn command(&self, command: StoreCommand) -> Result<StoreResponse, StoreError>;

    /// Run a script as one atomic unit and return its result.
    async fn execute(&self, script: &dyn AtomicScript) -> Result<Value, StoreError>;
}

#[async_trait]
impl<T: AtomicStore + ?Sized> AtomicStore for std::sync::Arc<T> {
    async fn command(&self, command: StoreCommand) -> Result<StoreResponse, StoreError> {
        (**self).command(command).await
    }

    async fn execute(&self, script: &dyn AtomicScript) -> Result<Value, StoreError> {
        (**self).execute(script).await
    }
}
