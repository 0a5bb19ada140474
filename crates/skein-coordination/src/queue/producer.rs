//! Publishing into a channel's ready collection.

use std::sync::Arc;

use skein_store::AtomicStore;
use skein_store::StoreCommand;
use skein_time::TimeProvider;
use tracing::debug;

use super::message::QueueMessage;
use crate::error::CoordinationError;
use crate::keys::KeySpace;

/// Inserts messages into ready collections, scored at the current time.
///
/// There is no deduplication: publishing the same payload twice yields two
/// messages with different ids.
pub struct QueueProducer<S: AtomicStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn TimeProvider>,
    keys: KeySpace,
}

impl<S: AtomicStore + ?Sized> Clone for QueueProducer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            keys: self.keys.clone(),
        }
    }
}

impl<S: AtomicStore + ?Sized> QueueProducer<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn TimeProvider>, keys: KeySpace) -> Self {
        Self { store, clock, keys }
    }

    /// Publish `message` to `channel`. Returns the message id.
    ///
    /// An id is generated unless the message already has one; `enqueueTime` is
    /// always set to now.
    pub async fn publish(&self, channel: &str, mut message: QueueMessage) -> Result<String, CoordinationError> {
        let now_ms = self.clock.now_unix_ms();
        let id = message.id.get_or_insert_with(|| uuid::Uuid::new_v4().to_string()).clone();
        message.enqueue_time = Some(now_ms);

        let member = message.encode()?;
        let ready = self.keys.channel(channel).ready;
        self.store.command(StoreCommand::zadd(&ready, member, now_ms as f64)).await?;
        debug!(channel = %channel, id = %id, "message published");
        Ok(id)
    }

    /// Publish `message` for delivery no earlier than `start_time_ms`.
    pub async fn publish_at(
        &self,
        channel: &str,
        message: QueueMessage,
        start_time_ms: u64,
    ) -> Result<String, CoordinationError> {
        self.publish(channel, message.with_start_time(start_time_ms)).await
    }
}

#[cfg(test)]
mod tests {
    use skein_store::InMemoryStore;
    use skein_time::SimulatedTimeProvider;

    use super::*;

    #[tokio::test]
    async fn publish_scores_at_now_and_assigns_ids() {
        let clock = SimulatedTimeProvider::new(7_000);
        let store = Arc::new(InMemoryStore::with_time_provider(Arc::new(clock.clone())));
        let producer = QueueProducer::new(Arc::clone(&store), Arc::new(clock), KeySpace::new("t"));

        let payload = QueueMessage::new().with_field("n", 1).unwrap();
        let a = producer.publish("jobs", payload.clone()).await.unwrap();
        let b = producer.publish_at("jobs", payload, 60_000).await.unwrap();
        assert_ne!(a, b);

        let members = store
            .command(StoreCommand::ZRange {
                key: "t:queue:jobs:ready".into(),
                start: 0,
                stop: -1,
            })
            .await
            .unwrap()
            .into_members()
            .unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.score == 7_000.0));
        let decoded: Vec<QueueMessage> = members.iter().map(|m| QueueMessage::decode(&m.member).unwrap()).collect();
        assert!(decoded.iter().all(|m| m.enqueue_time == Some(7_000)));
        assert!(decoded.iter().any(|m| m.start_time == Some(60_000)));
    }
}
