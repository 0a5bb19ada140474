//! Lease manager: polls a channel, leases messages, dispatches them.
//!
//! One poll cycle:
//!
//! 1. Atomically pop the earliest due ready entry and, when leased, move it to
//!    in-flight with deadline `now + lease`.
//! 2. Drop it if `endTime` has passed. Park it in-flight until `startTime` if
//!    it is not due yet.
//! 3. `noWait` messages leave in-flight immediately; `noWaitTimeout` schedules
//!    that removal instead.
//! 4. Renew the lease in the background while the handler works.
//! 5. When the handler reports, remove the message or requeue it with a retry
//!    deadline.
//!
//! Cross-process exclusion comes only from the atomic pop in step 1. Stopping
//! a consumer does not release what it holds; the monitor revives it once the
//! lease runs out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use skein_store::AtomicStore;
use skein_store::StoreCommand;
use skein_time::TimeProvider;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::handler::AckHandle;
use super::handler::AckReport;
use super::handler::HandlerRegistry;
use super::heartbeat::LeaseRenewal;
use super::message::LeasedMessage;
use super::message::QueueMessage;
use super::scripts::MoveMember;
use super::scripts::PopForLease;
use super::scripts::RemoveMember;
use crate::config::ChannelConfig;
use crate::config::CoordinationConfig;
use crate::constants::RETRYABLE_STATUS_MIN;
use crate::error::CoordinationError;
use crate::keys::ChannelKeys;
use crate::keys::KeySpace;
use crate::verified::AckDisposition;
use crate::verified::LeaseAction;
use crate::verified::ack_disposition;
use crate::verified::classify_leased;
use crate::verified::retry_deadline_ms;

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing due in the ready collection.
    Empty,
    /// `endTime` had passed; dropped without delivery.
    Expired { id: Option<String> },
    /// Not due yet; parked in-flight until `until_ms`.
    Deferred { id: Option<String>, until_ms: u64 },
    /// No handler registered; the message stays where the pop left it.
    NoHandler { id: Option<String> },
    /// The handler reported and the message was finalized.
    Handled {
        id: Option<String>,
        disposition: AckDisposition,
        poll_immediately: bool,
    },
    /// The handler dropped its ack without reporting.
    Abandoned { id: Option<String> },
    /// The consumer was stopped while the handler was running.
    Cancelled { id: Option<String> },
}

impl PollOutcome {
    /// Delay before the next poll of a loop driven by this outcome.
    pub fn next_delay_ms(&self, channel: &ChannelConfig) -> u64 {
        match self {
            Self::Empty | Self::NoHandler { .. } => channel.retry_interval_ms,
            Self::Handled {
                poll_immediately: true, ..
            } => 0,
            _ => channel.interval_ms,
        }
    }
}

enum Waited {
    Report(AckReport),
    Dropped,
    Cancelled,
}

/// Polls channels and dispatches messages to registered handlers.
pub struct QueueConsumer<S: AtomicStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn TimeProvider>,
    keys: KeySpace,
    config: Arc<CoordinationConfig>,
    handlers: Arc<HandlerRegistry>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl<S: AtomicStore + ?Sized> Clone for QueueConsumer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            keys: self.keys.clone(),
            config: Arc::clone(&self.config),
            handlers: Arc::clone(&self.handlers),
            running: Arc::clone(&self.running),
        }
    }
}

impl<S: AtomicStore + ?Sized + 'static> QueueConsumer<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn TimeProvider>,
        keys: KeySpace,
        config: Arc<CoordinationConfig>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            config,
            handlers,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Atomically take the next due message off `channel`.
    ///
    /// The caller owns the lease: nothing renews or finalizes it.
    pub async fn lease_next(&self, channel: &str) -> Result<Option<LeasedMessage>, CoordinationError> {
        let cfg = self.config.channel(channel);
        let keys = self.keys.channel(channel);
        let script = PopForLease {
            ready: keys.ready.clone(),
            in_flight: keys.in_flight.clone(),
            now_ms: self.clock.now_unix_ms(),
            channel_lease_ms: cfg.visibility_timeout_ms,
        };
        let result = self.store.execute(&script).await?;
        if result.is_null() {
            return Ok(None);
        }

        let member = match result.get("member").and_then(Value::as_str) {
            Some(member) => member.to_string(),
            None => {
                error!(channel = %channel, result = %result, "pop returned no member");
                return Err(CoordinationError::UnexpectedScriptResult {
                    script: "queue_pop_for_lease".to_string(),
                    reason: format!("missing member in {result}"),
                });
            }
        };
        let lease_deadline_ms = result.get("deadline").and_then(Value::as_u64);
        let lease_ms = result.get("lease").and_then(Value::as_u64).unwrap_or(0);

        let message = match QueueMessage::decode(&member) {
            Ok(message) => message,
            Err(e) => {
                error!(channel = %channel, error = %e, "dropping undecodable message");
                self.store.command(StoreCommand::zrem(&keys.in_flight, &member)).await?;
                return Err(e);
            }
        };
        debug!(channel = %channel, id = ?message.id, deadline_ms = ?lease_deadline_ms, "message leased");

        Ok(Some(LeasedMessage {
            channel: channel.to_string(),
            message,
            member,
            lease_deadline_ms,
            lease_ms,
        }))
    }

    /// Run one poll cycle on `channel`, waiting for the handler to report.
    pub async fn poll_once(&self, channel: &str) -> Result<PollOutcome, CoordinationError> {
        self.poll_with(channel, &CancellationToken::new()).await
    }

    async fn poll_with(&self, channel: &str, cancel: &CancellationToken) -> Result<PollOutcome, CoordinationError> {
        let Some(leased) = self.lease_next(channel).await? else {
            return Ok(PollOutcome::Empty);
        };
        let cfg = self.config.channel(channel);
        let keys = self.keys.channel(channel);
        let id = leased.message.id.clone();
        let now_ms = self.clock.now_unix_ms();

        match classify_leased(leased.message.start_time, leased.message.end_time, now_ms, cfg.max_timeout_ms) {
            LeaseAction::Expire => {
                self.store.command(StoreCommand::zrem(&keys.in_flight, &leased.member)).await?;
                debug!(channel = %channel, id = ?id, "message expired before delivery");
                return Ok(PollOutcome::Expired { id });
            }
            LeaseAction::Defer { until_ms } => {
                self.store.command(StoreCommand::zadd(&keys.in_flight, &leased.member, until_ms as f64)).await?;
                debug!(channel = %channel, id = ?id, until_ms, "message not due, deferred");
                return Ok(PollOutcome::Deferred { id, until_ms });
            }
            LeaseAction::Deliver => {}
        }

        let no_wait = leased.message.no_wait;
        let mut removal_guard = None;
        if no_wait {
            self.store.command(StoreCommand::zrem(&keys.in_flight, &leased.member)).await?;
        } else if let Some(secs) = leased.message.no_wait_timeout.filter(|s| *s > 0) {
            removal_guard = Some(self.schedule_removal(&keys, &leased.member, secs, cancel));
        }

        let Some(handler) = self.handlers.get(channel).await else {
            drop(removal_guard);
            warn!(channel = %channel, id = ?id, "no handler registered for channel");
            return Ok(PollOutcome::NoHandler { id });
        };

        let renewal = (leased.lease_ms > 0 && !no_wait).then(|| {
            LeaseRenewal::spawn(
                Arc::clone(&self.store),
                Arc::clone(&self.clock),
                keys.in_flight.clone(),
                leased.member.clone(),
                leased.lease_ms,
                cancel,
            )
        });

        let (ack, rx) = AckHandle::channel();
        let delivered = leased.clone();
        tokio::spawn(async move {
            handler.handle(delivered, ack).await;
        });

        let waited = tokio::select! {
            report = rx => match report {
                Ok(report) => Waited::Report(report),
                Err(_) => Waited::Dropped,
            },
            _ = cancel.cancelled() => Waited::Cancelled,
        };
        drop(removal_guard);
        if let Some(renewal) = renewal {
            renewal.stop().await;
        }

        match waited {
            Waited::Report(report) => {
                let poll_immediately = report.poll_immediately;
                let disposition = self.finalize(cfg, &keys, &leased, report).await?;
                Ok(PollOutcome::Handled {
                    id,
                    disposition,
                    poll_immediately,
                })
            }
            Waited::Dropped => {
                warn!(channel = %channel, id = ?id, "handler dropped ack without reporting");
                Ok(PollOutcome::Abandoned { id })
            }
            Waited::Cancelled => {
                debug!(channel = %channel, id = ?id, "consumer stopped while handler was running");
                Ok(PollOutcome::Cancelled { id })
            }
        }
    }

    /// Remove `member` from in-flight after `secs`, unless the guard drops first.
    fn schedule_removal(&self, keys: &ChannelKeys, member: &str, secs: u64, parent: &CancellationToken) -> DropGuard {
        let token = parent.child_token();
        let guard = token.clone().drop_guard();
        let store = Arc::clone(&self.store);
        let in_flight = keys.in_flight.clone();
        let member = member.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    if let Err(e) = store.command(StoreCommand::zrem(&in_flight, &member)).await {
                        warn!(key = %in_flight, error = %e, "no-wait timeout removal failed");
                    }
                }
            }
        });
        guard
    }

    async fn finalize(
        &self,
        cfg: &ChannelConfig,
        keys: &ChannelKeys,
        leased: &LeasedMessage,
        report: AckReport,
    ) -> Result<AckDisposition, CoordinationError> {
        let message = &leased.message;
        let status = report.error.as_ref().map(|e| e.status);
        let disposition = ack_disposition(status, message.no_wait, message.retry_count, cfg.max_retries);
        let both = vec![keys.ready.clone(), keys.in_flight.clone()];

        match disposition {
            AckDisposition::Complete => {
                self.remove(both, &leased.member).await?;
                debug!(channel = %leased.channel, id = ?message.id, "message acked");
            }
            AckDisposition::Reject => {
                self.remove(both, &leased.member).await?;
                warn!(
                    channel = %leased.channel,
                    id = ?message.id,
                    status = ?status,
                    error = ?report.error.as_ref().map(|e| e.message.as_str()),
                    "non-retryable handler failure, message removed"
                );
            }
            AckDisposition::Retry => {
                let status = status.unwrap_or(RETRYABLE_STATUS_MIN);
                let deadline_ms = retry_deadline_ms(
                    self.clock.now_unix_ms(),
                    message.retry_timeout_for(status),
                    cfg.retry_timeout_for(status),
                    leased.lease_ms,
                    cfg.retry_interval_ms,
                );
                let mut retried = message.clone();
                retried.retry_count = retried.retry_count.saturating_add(1);
                let target = if leased.lease_ms > 0 {
                    keys.in_flight.clone()
                } else {
                    keys.ready.clone()
                };
                let moved = self
                    .store
                    .execute(&MoveMember {
                        sources: both,
                        target,
                        member: leased.member.clone(),
                        new_member: retried.encode()?,
                        score: deadline_ms as f64,
                    })
                    .await?;
                if !moved.as_bool().unwrap_or(false) {
                    warn!(
                        channel = %leased.channel,
                        id = ?message.id,
                        status,
                        "lease lost before retry, message not requeued"
                    );
                    return Ok(disposition);
                }
                debug!(
                    channel = %leased.channel,
                    id = ?message.id,
                    status,
                    retry_count = retried.retry_count,
                    deadline_ms,
                    "message scheduled for retry"
                );
            }
            AckDisposition::RetriesExhausted => match &cfg.dead_letter_channel {
                Some(dead) => {
                    let now_ms = self.clock.now_unix_ms();
                    let mut parked = message.clone();
                    parked.retry_count = 0;
                    parked.enqueue_time = Some(now_ms);
                    let moved = self
                        .store
                        .execute(&MoveMember {
                            sources: both,
                            target: self.keys.channel(dead).ready,
                            member: leased.member.clone(),
                            new_member: parked.encode()?,
                            score: now_ms as f64,
                        })
                        .await?;
                    if !moved.as_bool().unwrap_or(false) {
                        warn!(
                            channel = %leased.channel,
                            id = ?message.id,
                            "lease lost before dead lettering, message not moved"
                        );
                        return Ok(disposition);
                    }
                    warn!(
                        channel = %leased.channel,
                        id = ?message.id,
                        dead_letter_channel = %dead,
                        retries = message.retry_count,
                        "retry cap reached, moved to dead letter channel"
                    );
                }
                None => {
                    self.remove(both, &leased.member).await?;
                    warn!(
                        channel = %leased.channel,
                        id = ?message.id,
                        retries = message.retry_count,
                        "retry cap reached, message dropped"
                    );
                }
            },
        }
        Ok(disposition)
    }

    async fn remove(&self, keys: Vec<String>, member: &str) -> Result<bool, CoordinationError> {
        let result = self
            .store
            .execute(&RemoveMember {
                keys,
                member: member.to_string(),
            })
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Start the poll loop for `channel`.
    ///
    /// Fails with [`CoordinationError::AlreadyRunning`] if this consumer
    /// already runs a loop for the channel.
    pub async fn start(&self, channel: &str) -> Result<ConsumerHandle, CoordinationError> {
        if !self.running.lock().await.insert(channel.to_string()) {
            return Err(CoordinationError::AlreadyRunning {
                channel: channel.to_string(),
            });
        }

        let cancel = CancellationToken::new();
        let consumer = self.clone();
        let token = cancel.clone();
        let name = channel.to_string();
        let task = tokio::spawn(async move { consumer.run(name, token).await });
        info!(channel = %channel, "consumer started");

        Ok(ConsumerHandle {
            channel: channel.to_string(),
            cancel,
            task: Some(task),
        })
    }

    /// Returns whether a loop is running for `channel`.
    pub async fn is_running(&self, channel: &str) -> bool {
        self.running.lock().await.contains(channel)
    }

    async fn run(self, channel: String, cancel: CancellationToken) {
        let cfg = self.config.channel(&channel).clone();
        while !cancel.is_cancelled() {
            let delay_ms = match self.poll_with(&channel, &cancel).await {
                Ok(outcome) => outcome.next_delay_ms(&cfg),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "poll failed, retrying");
                    cfg.retry_interval_ms
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
        self.running.lock().await.remove(&channel);
        info!(channel = %channel, "consumer stopped");
    }
}

/// Handle to a running poll loop. Dropping it stops the loop.
pub struct ConsumerHandle {
    channel: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for it to exit. Held messages are not released.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
