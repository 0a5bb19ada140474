//! Distributed token bucket rate limiter.
//!
//! Bucket state lives in a store hash (`count`, `mtime`, `interval`, `total`)
//! and every `consume` is one atomic script, so concurrent processes never
//! read-then-write the same bucket. The returned delay is advisory: nothing
//! stops a caller from ignoring it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use skein_store::AtomicScript;
use skein_store::AtomicStore;
use skein_store::StoreCommand;
use skein_store::StoreError;
use skein_store::Transaction;
use skein_time::TimeProvider;
use tracing::debug;
use tracing::warn;

use crate::error::CoordinationError;
use crate::keys::KeySpace;
use crate::types::BucketSnapshot;
use crate::types::RateLimitParams;
use crate::types::TokenGrant;
use crate::verified::BucketWrite;
use crate::verified::decide_consume;

const FIELD_COUNT: &str = "count";
const FIELD_MTIME: &str = "mtime";
const FIELD_INTERVAL: &str = "interval";
const FIELD_TOTAL: &str = "total";

/// Token bucket limiter bound to a store and namespace.
pub struct RateLimiter<S: AtomicStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn TimeProvider>,
    keys: KeySpace,
}

impl<S: AtomicStore + ?Sized> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            keys: self.keys.clone(),
        }
    }
}

impl<S: AtomicStore + ?Sized> RateLimiter<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn TimeProvider>, keys: KeySpace) -> Self {
        Self { store, clock, keys }
    }

    /// Consume one token, admitting the caller if the store cannot be reached.
    ///
    /// Any error is logged and turned into an admitted grant with
    /// `is_fail_open` set and a full bucket reported.
    pub async fn consume(&self, name: &str, params: &RateLimitParams) -> TokenGrant {
        match self.try_consume(name, params).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(limiter = %name, error = %e, "rate limiter unavailable, failing open");
                TokenGrant {
                    delay_ms: 0,
                    count: params.max,
                    total: 0,
                    elapsed_ms: 0,
                    interval_ms: params.interval_ms,
                    is_fail_open: true,
                }
            }
        }
    }

    /// Consume one token at the current time, returning store errors.
    pub async fn try_consume(&self, name: &str, params: &RateLimitParams) -> Result<TokenGrant, CoordinationError> {
        self.try_consume_at(name, params, self.clock.now_unix_ms()).await
    }

    /// Consume one token as of `now_ms`.
    pub async fn try_consume_at(
        &self,
        name: &str,
        params: &RateLimitParams,
        now_ms: u64,
    ) -> Result<TokenGrant, CoordinationError> {
        let script = ConsumeToken {
            key: self.keys.limiter(name),
            params: params.clone(),
            now_ms,
        };
        let result = self.store.execute(&script).await?;
        let grant: TokenGrant =
            serde_json::from_value(result).map_err(|e| CoordinationError::UnexpectedScriptResult {
                script: script.name().to_string(),
                reason: e.to_string(),
            })?;
        debug!(
            limiter = %name,
            delay_ms = grant.delay_ms,
            remaining = grant.count,
            total = grant.total,
            "token bucket consume"
        );
        Ok(grant)
    }

    /// Read the stored bucket without consuming.
    pub async fn peek(&self, name: &str) -> Result<Option<BucketSnapshot>, CoordinationError> {
        let key = self.keys.limiter(name);
        let fields = self.store.command(StoreCommand::hgetall(&key)).await?.into_hash()?;
        parse_snapshot(&fields).map_err(|reason| CoordinationError::CorruptedData { key, reason })
    }

    /// Delete the bucket. The next `consume` starts from a full bucket.
    pub async fn reset(&self, name: &str) -> Result<bool, CoordinationError> {
        let removed = self.store.command(StoreCommand::delete(self.keys.limiter(name))).await?.into_bool()?;
        debug!(limiter = %name, removed, "token bucket reset");
        Ok(removed)
    }
}

fn parse_field<T: std::str::FromStr>(fields: &BTreeMap<String, String>, name: &str) -> Result<Option<T>, String> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| format!("field '{name}' has invalid value '{raw}'")),
    }
}

/// Decode a bucket hash. An empty hash is an absent bucket.
fn parse_snapshot(fields: &BTreeMap<String, String>) -> Result<Option<BucketSnapshot>, String> {
    if fields.is_empty() {
        return Ok(None);
    }
    let count: f64 = parse_field(fields, FIELD_COUNT)?.ok_or("missing field 'count'")?;
    let last_refill_ms: u64 = parse_field(fields, FIELD_MTIME)?.ok_or("missing field 'mtime'")?;
    if !count.is_finite() {
        return Err(format!("field 'count' is not finite: {count}"));
    }
    Ok(Some(BucketSnapshot {
        count,
        last_refill_ms,
        last_interval_ms: parse_field(fields, FIELD_INTERVAL)?,
        total_requests: parse_field(fields, FIELD_TOTAL)?.unwrap_or(0),
    }))
}

/// One atomic token bucket step.
struct ConsumeToken {
    key: String,
    params: RateLimitParams,
    now_ms: u64,
}

impl ConsumeToken {
    fn persist(&self, txn: &mut dyn Transaction, snapshot: &BucketSnapshot) -> Result<(), StoreError> {
        txn.hset(&self.key, FIELD_COUNT, &snapshot.count.to_string())?;
        txn.hset(&self.key, FIELD_MTIME, &snapshot.last_refill_ms.to_string())?;
        txn.hset(&self.key, FIELD_TOTAL, &snapshot.total_requests.to_string())?;
        match snapshot.last_interval_ms {
            Some(interval) => {
                txn.hset(&self.key, FIELD_INTERVAL, &interval.to_string())?;
            }
            None => {
                txn.hdel(&self.key, FIELD_INTERVAL)?;
            }
        }
        if self.params.ttl_ms > 0 {
            txn.expire(&self.key, self.params.ttl_ms)?;
        }
        Ok(())
    }
}

impl AtomicScript for ConsumeToken {
    fn name(&self) -> &'static str {
        "rate_limiter_consume"
    }

    fn run(&self, txn: &mut dyn Transaction) -> Result<Value, StoreError> {
        let fields = txn.hgetall(&self.key)?;
        let stored = parse_snapshot(&fields).map_err(|reason| StoreError::ScriptFailed {
            script: self.name().to_string(),
            reason: format!("corrupted bucket '{}': {reason}", self.key),
        })?;

        let decision = decide_consume(stored.as_ref(), &self.params, self.now_ms);
        match &decision.write {
            BucketWrite::Persist(snapshot) => self.persist(txn, snapshot)?,
            BucketWrite::Reset => {
                txn.delete(&self.key)?;
            }
        }

        serde_json::to_value(&decision.grant).map_err(|e| StoreError::ScriptFailed {
            script: self.name().to_string(),
            reason: e.to_string(),
        })
    }
}
