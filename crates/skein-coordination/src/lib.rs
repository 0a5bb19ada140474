//! Distributed coordination primitives over an atomic key-value store.
//!
//! - [`Lock`] - named mutual exclusion on set-if-absent with TTL
//! - [`RateLimiter`] - token bucket with burst, refill, backoff and reset policy
//! - [`QueueProducer`] / [`QueueConsumer`] / [`QueueMonitor`] - at-least-once
//!   work queue with lease-based (visibility timeout) delivery
//! - [`CoordinationClient`] - facade that wires all of the above to one store,
//!   one namespace and one [`CoordinationConfig`]
//!
//! Every mutation of shared state is a single [`skein_store::AtomicScript`] or
//! single-step command; there is no in-process lock standing in for
//! cross-process exclusion.
//!
//! ## Queue Example
//!
//! ```ignore
//! use skein_coordination::{CoordinationClient, CoordinationConfig, QueueMessage, handler_fn};
//!
//! let client = CoordinationClient::new(store, CoordinationConfig::default())?;
//! client
//!     .subscribe("jobs", handler_fn(|msg, ack| async move {
//!         println!("got {:?}", msg.payload());
//!         ack.ack();
//!     }))
//!     .await;
//!
//! let consumer = client.start_consumer("jobs").await?;
//! let monitor = client.start_monitor("jobs");
//! client.publish("jobs", QueueMessage::new().with_field("id", 1)?).await?;
//! ```
//!
//! ## Rate Limiter Example
//!
//! ```ignore
//! use skein_coordination::RateLimitParams;
//!
//! let params = RateLimitParams::new(10.0, 10.0, 1_000).with_ttl_ms(60_000);
//! let grant = client.rate_limiter().consume("api:user-7", &params).await;
//! if !grant.is_admitted() {
//!     tokio::time::sleep(std::time::Duration::from_millis(grant.delay_ms)).await;
//! }
//! ```

mod client;
pub mod config;
pub mod constants;
mod error;
mod keys;
mod lock;
pub mod queue;
mod rate_limiter;
mod types;
pub mod verified;

pub use client::CoordinationClient;
pub use config::ChannelConfig;
pub use config::ConfigError;
pub use config::CoordinationConfig;
pub use error::CoordinationError;
pub use keys::ChannelKeys;
pub use keys::KeySpace;
pub use lock::Lock;
pub use queue::AckError;
pub use queue::AckHandle;
pub use queue::ConsumerHandle;
pub use queue::LeasedMessage;
pub use queue::MessageHandler;
pub use queue::MonitorHandle;
pub use queue::PollOutcome;
pub use queue::QueueConsumer;
pub use queue::QueueMessage;
pub use queue::QueueMonitor;
pub use queue::QueueProducer;
pub use queue::handler_fn;
pub use rate_limiter::RateLimiter;
pub use types::BucketSnapshot;
pub use types::RateLimitParams;
pub use types::TokenGrant;
