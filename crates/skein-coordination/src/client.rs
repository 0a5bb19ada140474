//! One-stop entry point wiring the primitives to a store and configuration.

use std::sync::Arc;

use skein_store::AtomicStore;
use skein_time::SystemTimeProvider;
use skein_time::TimeProvider;

use crate::config::ConfigError;
use crate::config::CoordinationConfig;
use crate::error::CoordinationError;
use crate::keys::KeySpace;
use crate::lock::Lock;
use crate::queue::ConsumerHandle;
use crate::queue::HandlerRegistry;
use crate::queue::MessageHandler;
use crate::queue::MonitorHandle;
use crate::queue::PollOutcome;
use crate::queue::QueueConsumer;
use crate::queue::QueueMessage;
use crate::queue::QueueMonitor;
use crate::queue::QueueProducer;
use crate::rate_limiter::RateLimiter;

/// Coordination client over a shared [`AtomicStore`].
///
/// Cloning is cheap; clones share the handler registry and the set of running
/// consumer loops.
pub struct CoordinationClient<S: AtomicStore + ?Sized> {
    config: Arc<CoordinationConfig>,
    lock: Lock<S>,
    rate_limiter: RateLimiter<S>,
    producer: QueueProducer<S>,
    consumer: QueueConsumer<S>,
    monitor: QueueMonitor<S>,
}

impl<S: AtomicStore + ?Sized> Clone for CoordinationClient<S> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            lock: self.lock.clone(),
            rate_limiter: self.rate_limiter.clone(),
            producer: self.producer.clone(),
            consumer: self.consumer.clone(),
            monitor: self.monitor.clone(),
        }
    }
}

impl<S: AtomicStore + ?Sized + 'static> CoordinationClient<S> {
    /// Create a client on the system clock. The configuration is validated.
    pub fn new(store: Arc<S>, config: CoordinationConfig) -> Result<Self, ConfigError> {
        Self::with_time_provider(store, config, Arc::new(SystemTimeProvider))
    }

    /// Create a client that reads time from `clock`.
    pub fn with_time_provider(
        store: Arc<S>,
        config: CoordinationConfig,
        clock: Arc<dyn TimeProvider>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let keys = KeySpace::new(config.namespace.clone());
        let config = Arc::new(config);
        Ok(Self {
            lock: Lock::new(Arc::clone(&store), keys.clone()),
            rate_limiter: RateLimiter::new(Arc::clone(&store), Arc::clone(&clock), keys.clone()),
            producer: QueueProducer::new(Arc::clone(&store), Arc::clone(&clock), keys.clone()),
            consumer: QueueConsumer::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                keys.clone(),
                Arc::clone(&config),
                Arc::new(HandlerRegistry::new()),
            ),
            monitor: QueueMonitor::new(store, clock, keys, Arc::clone(&config)),
            config,
        })
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn lock(&self) -> &Lock<S> {
        &self.lock
    }

    pub fn rate_limiter(&self) -> &RateLimiter<S> {
        &self.rate_limiter
    }

    pub fn producer(&self) -> &QueueProducer<S> {
        &self.producer
    }

    pub fn consumer(&self) -> &QueueConsumer<S> {
        &self.consumer
    }

    pub fn monitor(&self) -> &QueueMonitor<S> {
        &self.monitor
    }

    /// Publish to `channel`. Returns the message id.
    pub async fn publish(&self, channel: &str, message: QueueMessage) -> Result<String, CoordinationError> {
        self.producer.publish(channel, message).await
    }

    /// Register the handler for `channel`, replacing any previous one.
    pub async fn subscribe(&self, channel: &str, handler: impl MessageHandler) {
        self.consumer.handlers().register(channel, Arc::new(handler)).await;
    }

    /// Remove the handler for `channel`. Running loops keep polling and report
    /// `NoHandler` until a new one is registered.
    pub async fn unsubscribe(&self, channel: &str) -> bool {
        self.consumer.handlers().unregister(channel).await
    }

    pub async fn poll_once(&self, channel: &str) -> Result<PollOutcome, CoordinationError> {
        self.consumer.poll_once(channel).await
    }

    pub async fn start_consumer(&self, channel: &str) -> Result<ConsumerHandle, CoordinationError> {
        self.consumer.start(channel).await
    }

    pub fn start_monitor(&self, channel: &str) -> MonitorHandle {
        self.monitor.start(channel)
    }
}
