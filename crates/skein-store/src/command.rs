//! Single-step store commands and their responses.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::StoreError;
use crate::traits::Transaction;
use crate::types::ScoredMember;

/// A single primitive operation against the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreCommand {
    Get { key: String },
    Set { key: String, value: String, ttl_ms: Option<u64> },
    SetIfAbsent { key: String, value: String, ttl_ms: Option<u64> },
    Delete { key: String },
    Expire { key: String, ttl_ms: u64 },
    IncrBy { key: String, delta: i64 },
    HGet { key: String, field: String },
    HSet { key: String, field: String, value: String },
    HGetAll { key: String },
    HDel { key: String, field: String },
    ZAdd { key: String, member: String, score: f64 },
    ZScore { key: String, member: String },
    ZRem { key: String, member: String },
    ZCard { key: String },
    ZRangeByScore { key: String, min: f64, max: f64, limit: Option<u32> },
    ZRange { key: String, start: i64, stop: i64 },
    ZRemRangeByRank { key: String, start: i64, stop: i64 },
}

impl StoreCommand {
    pub fn get(key: impl Into<String>) -> Self {
        Self::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>, ttl_ms: Option<u64>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
            ttl_ms,
        }
    }

    pub fn set_if_absent(key: impl Into<String>, value: impl Into<String>, ttl_ms: Option<u64>) -> Self {
        Self::SetIfAbsent {
            key: key.into(),
            value: value.into(),
            ttl_ms,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    pub fn hgetall(key: impl Into<String>) -> Self {
        Self::HGetAll { key: key.into() }
    }

    pub fn zadd(key: impl Into<String>, member: impl Into<String>, score: f64) -> Self {
        Self::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        }
    }

    pub fn zrem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::ZRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn zcard(key: impl Into<String>) -> Self {
        Self::ZCard { key: key.into() }
    }

    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Set { .. } => "SET",
            Self::SetIfAbsent { .. } => "SETNX",
            Self::Delete { .. } => "DEL",
            Self::Expire { .. } => "EXPIRE",
            Self::IncrBy { .. } => "INCRBY",
            Self::HGet { .. } => "HGET",
            Self::HSet { .. } => "HSET",
            Self::HGetAll { .. } => "HGETALL",
            Self::HDel { .. } => "HDEL",
            Self::ZAdd { .. } => "ZADD",
            Self::ZScore { .. } => "ZSCORE",
            Self::ZRem { .. } => "ZREM",
            Self::ZCard { .. } => "ZCARD",
            Self::ZRangeByScore { .. } => "ZRANGEBYSCORE",
            Self::ZRange { .. } => "ZRANGE",
            Self::ZRemRangeByRank { .. } => "ZREMRANGEBYRANK",
        }
    }
}

/// Result of a [`StoreCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreResponse {
    Unit,
    Bool(bool),
    Integer(i64),
    Value(Option<String>),
    Score(Option<f64>),
    Hash(BTreeMap<String, String>),
    Members(Vec<ScoredMember>),
}

impl StoreResponse {
    pub fn into_bool(self) -> Result<bool, StoreError> {
        match self {
            Self::Bool(b) => Ok(b),
            other => Err(other.unexpected("bool")),
        }
    }

    pub fn into_integer(self) -> Result<i64, StoreError> {
        match self {
            Self::Integer(n) => Ok(n),
            other => Err(other.unexpected("integer")),
        }
    }

    pub fn into_value(self) -> Result<Option<String>, StoreError> {
        match self {
            Self::Value(v) => Ok(v),
            other => Err(other.unexpected("value")),
        }
    }

    pub fn into_hash(self) -> Result<BTreeMap<String, String>, StoreError> {
        match self {
            Self::Hash(h) => Ok(h),
            other => Err(other.unexpected("hash")),
        }
    }

    pub fn into_members(self) -> Result<Vec<ScoredMember>, StoreError> {
        match self {
            Self::Members(m) => Ok(m),
            other => Err(other.unexpected("members")),
        }
    }

    fn unexpected(&self, wanted: &str) -> StoreError {
        StoreError::UnexpectedResponse {
            command: wanted.to_string(),
            response: format!("{self:?}"),
        }
    }
}

/// Apply a command to a transaction.
///
/// Stores that implement [`Transaction`] can route [`AtomicStore::command`]
/// through this function so single-step commands and scripts share one code path.
///
/// [`AtomicStore::command`]: crate::AtomicStore::command
pub fn apply_command(txn: &mut dyn Transaction, command: StoreCommand) -> Result<StoreResponse, StoreError> {
    let response = match command {
        StoreCommand::Get { key } => StoreResponse::Value(txn.get(&key)?),
        StoreCommand::Set { key, value, ttl_ms } => {
            txn.set(&key, &value, ttl_ms)?;
            StoreResponse::Unit
        }
        StoreCommand::SetIfAbsent { key, value, ttl_ms } => {
            StoreResponse::Bool(txn.set_if_absent(&key, &value, ttl_ms)?)
        }
        StoreCommand::Delete { key } => StoreResponse::Bool(txn.delete(&key)?),
        StoreCommand::Expire { key, ttl_ms } => StoreResponse::Bool(txn.expire(&key, ttl_ms)?),
        StoreCommand::IncrBy { key, delta } => StoreResponse::Integer(txn.incr_by(&key, delta)?),
        StoreCommand::HGet { key, field } => StoreResponse::Value(txn.hget(&key, &field)?),
        StoreCommand::HSet { key, field, value } => StoreResponse::Bool(txn.hset(&key, &field, &value)?),
        StoreCommand::HGetAll { key } => StoreResponse::Hash(txn.hgetall(&key)?),
        StoreCommand::HDel { key, field } => StoreResponse::Bool(txn.hdel(&key, &field)?),
        StoreCommand::ZAdd { key, member, score } => StoreResponse::Bool(txn.zadd(&key, &member, score)?),
        StoreCommand::ZScore { key, member } => StoreResponse::Score(txn.zscore(&key, &member)?),
        StoreCommand::ZRem { key, member } => StoreResponse::Bool(txn.zrem(&key, &member)?),
        StoreCommand::ZCard { key } => StoreResponse::Integer(txn.zcard(&key)? as i64),
        StoreCommand::ZRangeByScore { key, min, max, limit } => {
            StoreResponse::Members(txn.zrange_by_score(&key, min, max, limit)?)
        }
        StoreCommand::ZRange { key, start, stop } => StoreResponse::Members(txn.zrange(&key, start, stop)?),
        StoreCommand::ZRemRangeByRank { key, start, stop } => {
            StoreResponse::Integer(txn.zrem_range_by_rank(&key, start, stop)? as i64)
        }
    };
    Ok(response)
}
