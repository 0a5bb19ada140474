//! Handler registry and the ack callback handed to handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::sync::oneshot;

use super::message::LeasedMessage;
use crate::verified::is_retryable_status;

/// Failure reported by a handler through [`AckHandle::finish`].
///
/// Statuses follow HTTP conventions: `>= 500` asks for redelivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckError {
    pub status: u16,
    pub message: String,
}

impl fmt::Display for AckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failed with status {}: {}", self.status, self.message)
    }
}

impl std::error::Error for AckError {}

impl AckError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// A 500, which is retried.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    /// A 400, which is not retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn is_retryable(&self) -> bool {
        is_retryable_status(self.status)
    }
}

/// What the handler reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReport {
    pub error: Option<AckError>,
    /// Poll the channel again right away instead of waiting `interval`.
    pub poll_immediately: bool,
}

/// Finalizes one delivery. Consumed on use, so a delivery is acked at most
/// once; dropping it unacked leaves the message for the monitor.
#[derive(Debug)]
pub struct AckHandle {
    tx: oneshot::Sender<AckReport>,
}

impl AckHandle {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<AckReport>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Report success.
    pub fn ack(self) {
        self.finish(Ok(()), false);
    }

    /// Report failure.
    pub fn nack(self, error: AckError) {
        self.finish(Err(error), false);
    }

    /// Report the outcome, optionally asking for an immediate next poll.
    pub fn finish(self, result: Result<(), AckError>, poll_immediately: bool) {
        // The consumer may have stopped waiting; nothing to do then.
        let _ = self.tx.send(AckReport {
            error: result.err(),
            poll_immediately,
        });
    }
}

/// Application callback for one channel.
///
/// The handler runs in its own task. It must eventually call one of the
/// [`AckHandle`] methods; the lease is renewed until it does.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: LeasedMessage, ack: AckHandle);
}

/// [`MessageHandler`] backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wrap a closure `Fn(LeasedMessage, AckHandle) -> impl Future<Output = ()>`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(LeasedMessage, AckHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(LeasedMessage, AckHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: LeasedMessage, ack: AckHandle) {
        (self.f)(message, ack).await
    }
}

/// Per-channel handler lookup shared by all consumers of a client.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `channel`, replacing any previous one.
    pub async fn register(&self, channel: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.insert(channel.into(), handler);
    }

    /// Returns whether a handler was registered.
    pub async fn unregister(&self, channel: &str) -> bool {
        self.handlers.write().await.remove(channel).is_some()
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().await.get(channel).cloned()
    }

    pub async fn contains(&self, channel: &str) -> bool {
        self.handlers.read().await.contains_key(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::message::QueueMessage;

    fn leased() -> LeasedMessage {
        LeasedMessage {
            channel: "jobs".into(),
            message: QueueMessage::new(),
            member: "{}".into(),
            lease_deadline_ms: None,
            lease_ms: 0,
        }
    }

    #[test]
    fn retryable_is_status_500_and_up() {
        assert!(AckError::retryable("boom").is_retryable());
        assert!(AckError::new(503, "busy").is_retryable());
        assert!(!AckError::permanent("bad").is_retryable());
        assert!(!AckError::new(499, "x").is_retryable());
    }

    #[tokio::test]
    async fn ack_reports_once_and_drop_closes() {
        let (ack, rx) = AckHandle::channel();
        ack.finish(Err(AckError::new(503, "busy")), true);
        let report = rx.await.unwrap();
        assert_eq!(report.error.map(|e| e.status), Some(503));
        assert!(report.poll_immediately);

        let (ack, rx) = AckHandle::channel();
        drop(ack);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn registry_lookup_and_closure_handlers() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("jobs").await.is_none());
        registry
            .register("jobs", Arc::new(handler_fn(|_msg, ack: AckHandle| async move { ack.ack() })))
            .await;
        let handler = registry.get("jobs").await.unwrap();

        let (ack, rx) = AckHandle::channel();
        handler.handle(leased(), ack).await;
        assert_eq!(rx.await.unwrap().error, None);

        assert!(registry.unregister("jobs").await);
        assert!(!registry.contains("jobs").await);
    }
}
