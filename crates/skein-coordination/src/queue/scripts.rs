//! Atomic store procedures for channel collections.
//!
//! Every transition between ready and in-flight runs as one of these scripts so
//! a message is always in exactly one collection and two consumers can never
//! lease the same entry.

use serde_json::Value;
use serde_json::json;
use skein_store::AtomicScript;
use skein_store::StoreError;
use skein_store::Transaction;

use crate::verified::effective_lease_ms;
use crate::verified::revive_scores;

/// Lease override read straight from a stored member.
fn member_lease_override(member: &str) -> Option<u64> {
    serde_json::from_str::<Value>(member).ok()?.get("visibilityTimeout")?.as_u64()
}

/// Pop the earliest due ready entry and, if it is leased, move it in-flight
/// with deadline `now + lease`.
///
/// Result: `null` when nothing is due, else `{"member", "deadline", "lease"}`.
pub(crate) struct PopForLease {
    pub ready: String,
    pub in_flight: String,
    pub now_ms: u64,
    pub channel_lease_ms: u64,
}

impl AtomicScript for PopForLease {
    fn name(&self) -> &'static str {
        "queue_pop_for_lease"
    }

    fn run(&self, txn: &mut dyn Transaction) -> Result<Value, StoreError> {
        let head = txn.zrange_by_score(&self.ready, f64::NEG_INFINITY, self.now_ms as f64, Some(1))?;
        let Some(entry) = head.into_iter().next() else {
            return Ok(Value::Null);
        };
        txn.zrem(&self.ready, &entry.member)?;

        let lease_ms = effective_lease_ms(member_lease_override(&entry.member), self.channel_lease_ms);
        let deadline = if lease_ms > 0 {
            let deadline = self.now_ms.saturating_add(lease_ms);
            txn.zadd(&self.in_flight, &entry.member, deadline as f64)?;
            Some(deadline)
        } else {
            None
        };
        Ok(json!({ "member": entry.member, "deadline": deadline, "lease": lease_ms }))
    }
}

/// Push an in-flight deadline forward, only if the entry is still there.
///
/// Result: bool, false when the lease was lost.
pub(crate) struct RenewLease {
    pub in_flight: String,
    pub member: String,
    pub deadline_ms: u64,
}

impl AtomicScript for RenewLease {
    fn name(&self) -> &'static str {
        "queue_renew_lease"
    }

    fn run(&self, txn: &mut dyn Transaction) -> Result<Value, StoreError> {
        if txn.zscore(&self.in_flight, &self.member)?.is_none() {
            return Ok(Value::Bool(false));
        }
        txn.zadd(&self.in_flight, &self.member, self.deadline_ms as f64)?;
        Ok(Value::Bool(true))
    }
}

/// Move up to `limit` in-flight entries with deadline <= now back to ready.
///
/// One sweep runs this repeatedly. The first run counts every expired entry
/// (`total: None`); later runs pass that count back with `start`, the number
/// revived so far, so ready scores keep increasing across batches.
///
/// Result: `{"revived", "ready", "total"}` with the ready size after the move.
pub(crate) struct ReviveExpired {
    pub ready: String,
    pub in_flight: String,
    pub now_ms: u64,
    pub limit: u32,
    pub total: Option<u64>,
    pub start: u64,
}

impl AtomicScript for ReviveExpired {
    fn name(&self) -> &'static str {
        "queue_revive_expired"
    }

    fn run(&self, txn: &mut dyn Transaction) -> Result<Value, StoreError> {
        let now = self.now_ms as f64;
        let total = match self.total {
            Some(total) => total,
            None => txn.zcount(&self.in_flight, f64::NEG_INFINITY, now)?,
        };
        let expired = txn.zrange_by_score(&self.in_flight, f64::NEG_INFINITY, now, Some(self.limit))?;
        let scores = revive_scores(self.now_ms, total, self.start, expired.len());
        for (entry, score) in expired.iter().zip(scores) {
            txn.zrem(&self.in_flight, &entry.member)?;
            txn.zadd(&self.ready, &entry.member, score)?;
        }
        let ready = txn.zcard(&self.ready)?;
        Ok(json!({ "revived": expired.len() as u64, "ready": ready, "total": total }))
    }
}

/// Remove `member` from every listed collection, then add `new_member` to
/// `target` at `score`.
///
/// Nothing is added when `member` is no longer present: another consumer has
/// already taken it over or finished it.
///
/// Result: bool, whether `member` was found anywhere.
pub(crate) struct MoveMember {
    pub sources: Vec<String>,
    pub target: String,
    pub member: String,
    pub new_member: String,
    pub score: f64,
}

impl AtomicScript for MoveMember {
    fn name(&self) -> &'static str {
        "queue_move_member"
    }

    fn run(&self, txn: &mut dyn Transaction) -> Result<Value, StoreError> {
        let mut found = false;
        for source in &self.sources {
            found |= txn.zrem(source, &self.member)?;
        }
        if found {
            txn.zadd(&self.target, &self.new_member, self.score)?;
        }
        Ok(Value::Bool(found))
    }
}

/// Remove `member` from every listed collection.
///
/// Result: bool, whether it was found anywhere.
pub(crate) struct RemoveMember {
    pub keys: Vec<String>,
    pub member: String,
}

impl AtomicScript for RemoveMember {
    fn name(&self) -> &'static str {
        "queue_remove_member"
    }

    fn run(&self, txn: &mut dyn Transaction) -> Result<Value, StoreError> {
        let mut found = false;
        for key in &self.keys {
            found |= txn.zrem(key, &self.member)?;
        }
        Ok(Value::Bool(found))
    }
}
