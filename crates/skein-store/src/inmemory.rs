//! Deterministic in-memory [`AtomicStore`].
//!
//! All state sits behind one async mutex, so every command and every script is
//! trivially atomic with respect to every other. TTLs are evaluated lazily
//! against an injectable [`TimeProvider`], which lets tests expire locks and
//! limiter buckets by advancing a simulated clock.
//!
//! [`InMemoryStore::set_offline`] makes every call fail with
//! [`StoreError::Unavailable`] until switched back, for exercising degraded
//! paths.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use serde_json::Value;
use skein_time::SystemTimeProvider;
use skein_time::TimeProvider;
use tokio::sync::Mutex;
use tracing::trace;

use crate::command::StoreCommand;
use crate::command::StoreResponse;
use crate::command::apply_command;
use crate::error::StoreError;
use crate::traits::AtomicScript;
use crate::traits::AtomicStore;
use crate::traits::Transaction;
use crate::types::ScoredMember;

/// Score wrapper with a total order so it can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == CmpOrdering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

/// Ordered collection: members sorted by (score, member).
#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) -> bool {
        let is_new = match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.to_string()));
                false
            }
            None => true,
        };
        self.ordered.insert((Score(score), member.to_string()));
        is_new
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    fn range_by_score(&self, min: f64, max: f64, limit: Option<u32>) -> Vec<ScoredMember> {
        let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
        self.ordered
            .range((Score(min), String::new())..)
            .take_while(|(score, _)| score.0 <= max)
            .take(limit)
            .map(|(score, member)| ScoredMember::new(member.clone(), score.0))
            .collect()
    }

    fn by_rank(&self, start: i64, stop: i64) -> Vec<ScoredMember> {
        match normalize_rank(start, stop, self.len()) {
            Some((from, to)) => self
                .ordered
                .iter()
                .skip(from)
                .take(to - from + 1)
                .map(|(score, member)| ScoredMember::new(member.clone(), score.0))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Resolve inclusive rank bounds with negative indexing. `None` means empty.
fn normalize_rank(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    let len = len as i64;
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[derive(Debug, Clone)]
enum EntryValue {
    Str(String),
    Hash(BTreeMap<String, String>),
    Sorted(SortedSet),
}

#[derive(Debug, Clone)]
struct Entry {
    value: EntryValue,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn new(value: EntryValue) -> Self {
        Self {
            value,
            expires_at_ms: None,
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|deadline| now_ms >= deadline)
    }
}

/// [`Transaction`] over the locked map, with time frozen for the unit.
struct MemoryTxn<'a> {
    data: &'a mut BTreeMap<String, Entry>,
    now_ms: u64,
}

impl MemoryTxn<'_> {
    fn purge_expired(&mut self, key: &str) {
        if self.data.get(key).is_some_and(|e| e.is_expired(self.now_ms)) {
            self.data.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_expired(key);
        self.data.get_mut(key)
    }

    fn deadline(&self, ttl_ms: Option<u64>) -> Option<u64> {
        ttl_ms.filter(|ttl| *ttl > 0).map(|ttl| self.now_ms.saturating_add(ttl))
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut BTreeMap<String, String>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: EntryValue::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> Result<&mut BTreeMap<String, String>, StoreError> {
        self.purge_expired(key);
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(EntryValue::Hash(BTreeMap::new())));
        match &mut entry.value {
            EntryValue::Hash(h) => Ok(h),
            _ => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    fn sorted(&mut self, key: &str) -> Result<Option<&mut SortedSet>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: EntryValue::Sorted(s),
                ..
            }) => Ok(Some(s)),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    fn sorted_or_create(&mut self, key: &str) -> Result<&mut SortedSet, StoreError> {
        self.purge_expired(key);
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(EntryValue::Sorted(SortedSet::default())));
        match &mut entry.value {
            EntryValue::Sorted(s) => Ok(s),
            _ => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.data.get(key).map(|e| &e.value) {
            Some(EntryValue::Sorted(s)) => s.is_empty(),
            Some(EntryValue::Hash(h)) => h.is_empty(),
            _ => false,
        };
        if empty {
            self.data.remove(key);
        }
    }
}

impl Transaction for MemoryTxn<'_> {
    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: EntryValue::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    fn set(&mut self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let expires_at_ms = self.deadline(ttl_ms);
        self.data.insert(key.to_string(), Entry {
            value: EntryValue::Str(value.to_string()),
            expires_at_ms,
        });
        Ok(())
    }

    fn set_if_absent(&mut self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<bool, StoreError> {
        if self.live(key).is_some() {
            return Ok(false);
        }
        self.set(key, value, ttl_ms)?;
        Ok(true)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        self.purge_expired(key);
        Ok(self.data.remove(key).is_some())
    }

    fn expire(&mut self, key: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let deadline = self.deadline(Some(ttl_ms));
        match self.live(key) {
            Some(entry) => {
                entry.expires_at_ms = deadline;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let current = match self.live(key) {
            None => 0,
            Some(Entry {
                value: EntryValue::Str(s),
                ..
            }) => s.parse::<i64>().map_err(|_| StoreError::NotInteger { key: key.to_string() })?,
            Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
        };
        let next = current.saturating_add(delta);
        match self.data.get_mut(key) {
            Some(entry) => entry.value = EntryValue::Str(next.to_string()),
            None => {
                self.data.insert(key.to_string(), Entry::new(EntryValue::Str(next.to_string())));
            }
        }
        Ok(next)
    }

    fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let hash = self.hash_or_create(key)?;
        Ok(hash.insert(field.to_string(), value.to_string()).is_none())
    }

    fn hgetall(&mut self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        Ok(self.hash(key)?.cloned().unwrap_or_default())
    }

    fn hdel(&mut self, key: &str, field: &str) -> Result<bool, StoreError> {
        let removed = match self.hash(key)? {
            Some(h) => h.remove(field).is_some(),
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        Ok(self.sorted_or_create(key)?.insert(member, score))
    }

    fn zscore(&mut self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        Ok(self.sorted(key)?.and_then(|s| s.scores.get(member).copied()))
    }

    fn zrem(&mut self, key: &str, member: &str) -> Result<bool, StoreError> {
        let removed = match self.sorted(key)? {
            Some(s) => s.remove(member),
            None => false,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn zcard(&mut self, key: &str) -> Result<u64, StoreError> {
        Ok(self.sorted(key)?.map(|s| s.len() as u64).unwrap_or(0))
    }

    fn zrange_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<u32>,
    ) -> Result<Vec<ScoredMember>, StoreError> {
        Ok(self.sorted(key)?.map(|s| s.range_by_score(min, max, limit)).unwrap_or_default())
    }

    fn zrange(&mut self, key: &str, start: i64, stop: i64) -> Result<Vec<ScoredMember>, StoreError> {
        Ok(self.sorted(key)?.map(|s| s.by_rank(start, stop)).unwrap_or_default())
    }

    fn zrem_range_by_rank(&mut self, key: &str, start: i64, stop: i64) -> Result<u64, StoreError> {
        let removed = match self.sorted(key)? {
            Some(set) => {
                let victims = set.by_rank(start, stop);
                for victim in &victims {
                    set.remove(&victim.member);
                }
                victims.len() as u64
            }
            None => 0,
        };
        self.drop_if_empty(key);
        Ok(removed)
    }
}

/// Thread-safe in-memory store for tests and single-process deployments.
pub struct InMemoryStore {
    data: Mutex<BTreeMap<String, Entry>>,
    clock: Arc<dyn TimeProvider>,
    is_offline: AtomicBool,
    scripts_executed: AtomicU64,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_time_provider(Arc::new(SystemTimeProvider))
    }
}

impl InMemoryStore {
    /// Create a store on the system clock, wrapped in `Arc`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a store whose TTLs are evaluated against `clock`.
    pub fn with_time_provider(clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            clock,
            is_offline: AtomicBool::new(false),
            scripts_executed: AtomicU64::new(0),
        }
    }

    /// Simulate loss of connectivity.
    pub fn set_offline(&self, is_offline: bool) {
        self.is_offline.store(is_offline, Ordering::SeqCst);
    }

    /// Number of scripts run so far.
    pub fn scripts_executed(&self) -> u64 {
        self.scripts_executed.load(Ordering::Relaxed)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.is_offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "in-memory store set offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AtomicStore for InMemoryStore {
    async fn command(&self, command: StoreCommand) -> Result<StoreResponse, StoreError> {
        self.check_online()?;
        let mut data = self.data.lock().await;
        let mut txn = MemoryTxn {
            data: &mut *data,
            now_ms: self.clock.now_unix_ms(),
        };
        trace!(command = command.name(), "applying store command");
        apply_command(&mut txn, command)
    }

    async fn execute(&self, script: &dyn AtomicScript) -> Result<Value, StoreError> {
        self.check_online()?;
        let mut data = self.data.lock().await;
        let mut txn = MemoryTxn {
            data: &mut *data,
            now_ms: self.clock.now_unix_ms(),
        };
        self.scripts_executed.fetch_add(1, Ordering::Relaxed);
        trace!(script = script.name(), "executing atomic script");
        script.run(&mut txn)
    }
}
