//! Queue message wire format.
//!
//! A message is a JSON object. Scheduling fields sit at the top level next to
//! the caller's payload fields:
//!
//! | field                    | meaning                                         |
//! |--------------------------|-------------------------------------------------|
//! | `id`                     | assigned at publish, keeps equal payloads apart |
//! | `enqueueTime`            | publish time (Unix ms)                          |
//! | `startTime`              | not delivered before this time (Unix ms)        |
//! | `endTime`                | dropped undelivered once this time is reached   |
//! | `noWait`                 | removed from in-flight on delivery              |
//! | `noWaitTimeout`          | removed from in-flight after this many seconds  |
//! | `visibilityTimeout`      | lease override (ms)                             |
//! | `retryVisibilityTimeout` | retry lease per handler status code (ms)        |
//! | `retryCount`             | redeliveries after retryable failures           |
//!
//! The JSON text itself is the member stored in the channel collections.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::CoordinationError;

/// Top-level fields the queue interprets.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "enqueueTime",
    "startTime",
    "endTime",
    "noWait",
    "noWaitTimeout",
    "visibilityTimeout",
    "retryVisibilityTimeout",
    "retryCount",
];

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// A queue message: scheduling fields plus an arbitrary payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueue_time: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub no_wait: bool,

    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_wait_timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_timeout: Option<u64>,

    /// Keyed by status code as a string; JSON object keys are strings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retry_visibility_timeout: BTreeMap<String, u64>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl QueueMessage {
    /// A message with an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object. Reserved top-level fields are read as
    /// scheduling fields; everything else becomes payload.
    pub fn from_json(value: Value) -> Result<Self, CoordinationError> {
        if !value.is_object() {
            return Err(CoordinationError::InvalidMessage {
                reason: format!("message must be a JSON object, got {value}"),
            });
        }
        serde_json::from_value(value).map_err(|e| CoordinationError::InvalidMessage { reason: e.to_string() })
    }

    /// Add a payload field. Reserved names are rejected.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<Self, CoordinationError> {
        let key = key.into();
        if RESERVED_FIELDS.contains(&key.as_str()) {
            return Err(CoordinationError::InvalidMessage {
                reason: format!("'{key}' is a reserved field"),
            });
        }
        self.payload.insert(key, value.into());
        Ok(self)
    }

    pub fn with_start_time(mut self, start_time_ms: u64) -> Self {
        self.start_time = Some(start_time_ms);
        self
    }

    pub fn with_end_time(mut self, end_time_ms: u64) -> Self {
        self.end_time = Some(end_time_ms);
        self
    }

    pub fn with_no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn with_no_wait_timeout_secs(mut self, secs: u64) -> Self {
        self.no_wait_timeout = Some(secs);
        self
    }

    pub fn with_visibility_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.visibility_timeout = Some(timeout_ms);
        self
    }

    pub fn with_retry_timeout_ms(mut self, status: u16, timeout_ms: u64) -> Self {
        self.retry_visibility_timeout.insert(status.to_string(), timeout_ms);
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// Message-level retry lease for a handler status.
    pub fn retry_timeout_for(&self, status: u16) -> Option<u64> {
        self.retry_visibility_timeout.get(&status.to_string()).copied()
    }

    pub fn encode(&self) -> Result<String, CoordinationError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, CoordinationError> {
        serde_json::from_str(raw).map_err(|e| CoordinationError::InvalidMessage {
            reason: format!("undecodable message: {e}"),
        })
    }
}

/// A message handed to a handler, with its lease bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedMessage {
    /// Channel the message was polled from.
    pub channel: String,
    pub message: QueueMessage,
    /// The exact stored member, used to find it again in the store.
    pub member: String,
    /// In-flight deadline at lease time; `None` in non-leased mode.
    pub lease_deadline_ms: Option<u64>,
    /// Lease duration used for renewal (0 = not leased).
    pub lease_ms: u64,
}

impl LeasedMessage {
    pub fn id(&self) -> Option<&str> {
        self.message.id.as_deref()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.message.payload
    }
}
