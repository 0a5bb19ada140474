//! At-least-once work queue with lease-based delivery.
//!
//! A channel is a pair of ordered collections: **ready** (scored by enqueue or
//! retry time) and **in-flight** (scored by lease deadline). A message lives in
//! exactly one of them while it is owned by the queue.
//!
//! - [`QueueProducer`] inserts into ready.
//! - [`QueueConsumer`] pops, leases, renews and finalizes.
//! - [`QueueMonitor`] moves expired leases back to ready.

mod consumer;
mod handler;
mod heartbeat;
mod message;
mod monitor;
mod producer;
mod scripts;

pub use consumer::ConsumerHandle;
pub use consumer::PollOutcome;
pub use consumer::QueueConsumer;
pub use handler::AckError;
pub use handler::AckHandle;
pub use handler::AckReport;
pub use handler::FnHandler;
pub use handler::HandlerRegistry;
pub use handler::MessageHandler;
pub use handler::handler_fn;
pub use message::LeasedMessage;
pub use message::QueueMessage;
pub use message::RESERVED_FIELDS;
pub use monitor::ChannelStats;
pub use monitor::MonitorHandle;
pub use monitor::QueueMonitor;
pub use monitor::SweepReport;
pub use producer::QueueProducer;
