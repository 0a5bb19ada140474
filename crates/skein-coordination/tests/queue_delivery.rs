//! End-to-end delivery behaviour of the lease queue over the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use skein_coordination::AckError;
use skein_coordination::AckHandle;
use skein_coordination::ChannelConfig;
use skein_coordination::CoordinationClient;
use skein_coordination::CoordinationConfig;
use skein_coordination::LeasedMessage;
use skein_coordination::PollOutcome;
use skein_coordination::QueueMessage;
use skein_coordination::handler_fn;
use skein_coordination::verified::AckDisposition;
use skein_store::InMemoryStore;
use skein_time::SimulatedTimeProvider;
use skein_time::TimeProvider;
use tokio::sync::mpsc;

const START_MS: u64 = 1_700_000_000_000;

fn client_with(
    channel: ChannelConfig,
) -> (CoordinationClient<InMemoryStore>, Arc<InMemoryStore>, SimulatedTimeProvider) {
    let clock = SimulatedTimeProvider::new(START_MS);
    let store = Arc::new(InMemoryStore::with_time_provider(Arc::new(clock.clone())));
    let config = CoordinationConfig::new("it").with_channel("jobs", channel);
    let client = CoordinationClient::with_time_provider(Arc::clone(&store), config, Arc::new(clock.clone())).unwrap();
    (client, store, clock)
}

/// Handler that forwards every delivery and acks with `result`.
fn forwarding(
    clock: SimulatedTimeProvider,
    result: Result<(), AckError>,
) -> (impl skein_coordination::MessageHandler, mpsc::UnboundedReceiver<(LeasedMessage, u64)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |msg: LeasedMessage, ack: AckHandle| {
        let _ = tx.send((msg, clock.now_unix_ms()));
        let result = result.clone();
        async move { ack.finish(result, false) }
    });
    (handler, rx)
}

#[tokio::test]
async fn unacked_message_is_redelivered_after_visibility_timeout() {
    let (client, _, clock) = client_with(ChannelConfig::default().with_visibility_timeout_ms(5_000));
    let id = client.publish("jobs", QueueMessage::new().with_field("job", "m").unwrap()).await.unwrap();

    let first = client.consumer().lease_next("jobs").await.unwrap().unwrap();
    assert_eq!(first.id(), Some(id.as_str()));
    assert_eq!(first.lease_deadline_ms, Some(START_MS + 5_000));

    // Live lease: nobody else gets it, and a sweep leaves it alone.
    assert!(client.consumer().lease_next("jobs").await.unwrap().is_none());
    assert_eq!(client.monitor().sweep("jobs").await.unwrap().revived, 0);

    clock.advance_ms(6_000);
    let report = client.monitor().sweep("jobs").await.unwrap();
    assert_eq!(report.revived, 1);
    let again = client.consumer().lease_next("jobs").await.unwrap().unwrap();
    assert_eq!(again.id(), Some(id.as_str()));
    assert_eq!(again.payload().get("job"), Some(&serde_json::json!("m")));
}

#[tokio::test]
async fn abandoned_delivery_comes_back_to_the_handler() {
    let (client, _, clock) = client_with(ChannelConfig::default().with_visibility_timeout_ms(5_000));
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe(
            "jobs",
            handler_fn(move |msg: LeasedMessage, ack: AckHandle| {
                let _ = tx.send(msg.id().map(str::to_owned));
                // The first lease is dropped on the floor, as if the worker died.
                let first_lease = msg.lease_deadline_ms == Some(START_MS + 5_000);
                async move {
                    if first_lease {
                        drop(ack);
                    } else {
                        ack.ack();
                    }
                }
            }),
        )
        .await;
    client.publish("jobs", QueueMessage::new()).await.unwrap();

    assert!(matches!(client.poll_once("jobs").await.unwrap(), PollOutcome::Abandoned { .. }));
    clock.advance_ms(6_000);
    client.monitor().sweep("jobs").await.unwrap();
    assert!(matches!(
        client.poll_once("jobs").await.unwrap(),
        PollOutcome::Handled {
            disposition: AckDisposition::Complete,
            ..
        }
    ));

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first, second);
    let stats = client.monitor().stats("jobs").await.unwrap();
    assert_eq!((stats.ready, stats.in_flight), (0, 0));
}

#[tokio::test]
async fn delayed_message_is_never_early() {
    let (client, _, clock) = client_with(ChannelConfig::default().with_visibility_timeout_ms(5_000));
    let (handler, mut rx) = forwarding(clock.clone(), Ok(()));
    client.subscribe("jobs", handler).await;
    let start_time = START_MS + 10_000;
    client.producer().publish_at("jobs", QueueMessage::new(), start_time).await.unwrap();

    assert!(matches!(
        client.poll_once("jobs").await.unwrap(),
        PollOutcome::Deferred { until_ms, .. } if until_ms == start_time
    ));
    for _ in 0..9 {
        clock.advance_ms(1_111);
        client.monitor().sweep("jobs").await.unwrap();
        assert_eq!(client.poll_once("jobs").await.unwrap(), PollOutcome::Empty);
    }
    clock.set_ms(start_time);
    client.monitor().sweep("jobs").await.unwrap();
    assert!(matches!(client.poll_once("jobs").await.unwrap(), PollOutcome::Handled { .. }));

    let (_, delivered_at) = rx.recv().await.unwrap();
    assert!(delivered_at >= start_time);
}

#[tokio::test]
async fn far_future_message_is_parked_at_most_max_timeout() {
    let channel = ChannelConfig {
        max_timeout_ms: 60_000,
        ..ChannelConfig::default().with_visibility_timeout_ms(5_000)
    };
    let (client, _, clock) = client_with(channel);
    client.producer().publish_at("jobs", QueueMessage::new(), START_MS + 3_600_000).await.unwrap();

    assert!(matches!(
        client.poll_once("jobs").await.unwrap(),
        PollOutcome::Deferred { until_ms, .. } if until_ms == START_MS + 60_000
    ));
    clock.advance_ms(60_000);
    assert_eq!(client.monitor().sweep("jobs").await.unwrap().revived, 1);
    assert!(matches!(
        client.poll_once("jobs").await.unwrap(),
        PollOutcome::Deferred { until_ms, .. } if until_ms == START_MS + 120_000
    ));
}

#[tokio::test]
async fn expired_message_never_reaches_the_handler() {
    let (client, _, clock) = client_with(ChannelConfig::default());
    let (handler, mut rx) = forwarding(clock.clone(), Ok(()));
    client.subscribe("jobs", handler).await;
    client.publish("jobs", QueueMessage::new().with_end_time(START_MS + 100)).await.unwrap();

    clock.advance_ms(101);
    assert!(matches!(client.poll_once("jobs").await.unwrap(), PollOutcome::Expired { .. }));
    assert_eq!(client.poll_once("jobs").await.unwrap(), PollOutcome::Empty);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_never_share_a_lease() {
    let (client, store, clock) = client_with(ChannelConfig::default().with_visibility_timeout_ms(60_000));
    for n in 0..200 {
        client.publish("jobs", QueueMessage::new().with_field("n", n).unwrap()).await.unwrap();
    }

    // Independent clients over the same store behave like separate processes.
    let mut workers = Vec::new();
    for _ in 0..4 {
        let channel = ChannelConfig::default().with_visibility_timeout_ms(60_000);
        let config = CoordinationConfig::new("it").with_channel("jobs", channel);
        let peer = CoordinationClient::with_time_provider(Arc::clone(&store), config, Arc::new(clock.clone())).unwrap();
        workers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(leased) = peer.consumer().lease_next("jobs").await.unwrap() {
                ids.push(leased.message.id.unwrap());
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for worker in workers {
        for id in worker.await.unwrap() {
            total += 1;
            assert!(seen.insert(id), "message leased twice");
        }
    }
    assert_eq!(total, 200);
    let stats = client.monitor().stats("jobs").await.unwrap();
    assert_eq!((stats.ready, stats.in_flight), (0, 200));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_keeps_a_slow_handler_leased() {
    let _ = tracing_subscriber::fmt().with_env_filter("skein_coordination=debug").try_init();
    let (client, _, clock) = client_with(ChannelConfig::default().with_visibility_timeout_ms(1_000));
    client
        .subscribe(
            "jobs",
            handler_fn(|_msg: LeasedMessage, ack: AckHandle| async move {
                tokio::time::sleep(Duration::from_millis(2_500)).await;
                ack.ack();
            }),
        )
        .await;
    client.publish("jobs", QueueMessage::new()).await.unwrap();

    let poller = {
        let client = client.clone();
        tokio::spawn(async move { client.poll_once("jobs").await })
    };
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        clock.advance_ms(100);
        assert_eq!(client.monitor().sweep("jobs").await.unwrap().revived, 0);
        assert!(client.consumer().lease_next("jobs").await.unwrap().is_none());
    }

    let outcome = poller.await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        PollOutcome::Handled {
            disposition: AckDisposition::Complete,
            ..
        }
    ));
    let stats = client.monitor().stats("jobs").await.unwrap();
    assert_eq!((stats.ready, stats.in_flight), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn no_wait_timeout_releases_a_slow_handlers_message() {
    let (client, _, _) = client_with(ChannelConfig::default());
    client
        .subscribe(
            "jobs",
            handler_fn(|_msg: LeasedMessage, ack: AckHandle| async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                ack.ack();
            }),
        )
        .await;
    client.publish("jobs", QueueMessage::new().with_no_wait_timeout_secs(1)).await.unwrap();

    let poller = {
        let client = client.clone();
        tokio::spawn(async move { client.poll_once("jobs").await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.monitor().stats("jobs").await.unwrap().in_flight, 1);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let stats = client.monitor().stats("jobs").await.unwrap();
    assert_eq!((stats.ready, stats.in_flight), (0, 0));

    assert!(matches!(poller.await.unwrap().unwrap(), PollOutcome::Handled { .. }));
}

#[tokio::test(start_paused = true)]
async fn no_wait_timeout_is_cancelled_when_the_handler_finishes_first() {
    let (client, _, clock) = client_with(ChannelConfig::default());
    let (handler, _rx) = forwarding(clock, Err(AckError::new(503, "unavailable")));
    client.subscribe("jobs", handler).await;
    client.publish("jobs", QueueMessage::new().with_no_wait_timeout_secs(1)).await.unwrap();

    assert!(matches!(
        client.poll_once("jobs").await.unwrap(),
        PollOutcome::Handled {
            disposition: AckDisposition::Retry,
            ..
        }
    ));
    tokio::time::sleep(Duration::from_secs(3)).await;
    let stats = client.monitor().stats("jobs").await.unwrap();
    assert_eq!((stats.ready, stats.in_flight), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn running_consumer_rides_out_a_store_outage() {
    let _ = tracing_subscriber::fmt().with_env_filter("skein_coordination=debug").try_init();
    let (client, store, clock) = client_with(ChannelConfig::default().with_intervals_ms(50, 100));
    let (handler, mut rx) = forwarding(clock, Ok(()));
    client.subscribe("jobs", handler).await;

    store.set_offline(true);
    let consumer = client.start_consumer("jobs").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(consumer.is_running());

    store.set_offline(false);
    client.publish("jobs", QueueMessage::new().with_field("after", "outage").unwrap()).await.unwrap();
    let (msg, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(msg.payload().get("after"), Some(&serde_json::json!("outage")));

    consumer.stop().await;
    assert!(!client.consumer().is_running("jobs").await);
}

#[tokio::test]
async fn retries_forever_without_a_cap() {
    let (client, _, clock) =
        client_with(ChannelConfig::default().with_visibility_timeout_ms(0).with_intervals_ms(10, 10));
    let (handler, mut rx) = forwarding(clock.clone(), Err(AckError::new(503, "unavailable")));
    client.subscribe("jobs", handler).await;
    client.publish("jobs", QueueMessage::new()).await.unwrap();

    for attempt in 0..25u32 {
        assert!(matches!(
            client.poll_once("jobs").await.unwrap(),
            PollOutcome::Handled {
                disposition: AckDisposition::Retry,
                ..
            }
        ));
        let (msg, _) = rx.recv().await.unwrap();
        assert_eq!(msg.message.retry_count, attempt);
        clock.advance_ms(10);
    }
}

#[tokio::test]
async fn message_retry_timeout_overrides_channel_default() {
    let (client, _, clock) = client_with(ChannelConfig::default().with_visibility_timeout_ms(5_000));
    let (handler, _rx) = forwarding(clock.clone(), Err(AckError::new(502, "bad gateway")));
    client.subscribe("jobs", handler).await;
    client
        .publish("jobs", QueueMessage::new().with_retry_timeout_ms(502, 30_000))
        .await
        .unwrap();

    client.poll_once("jobs").await.unwrap();
    clock.advance_ms(29_999);
    assert_eq!(client.monitor().sweep("jobs").await.unwrap().revived, 0);
    clock.advance_ms(1);
    assert_eq!(client.monitor().sweep("jobs").await.unwrap().revived, 1);
}
