//! Periodic reclamation of expired leases.
//!
//! A sweep moves every in-flight entry whose deadline has passed back to ready,
//! which is what turns a crashed consumer into a redelivery instead of a lost
//! message. Deferred messages come back the same way once they are due.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use skein_store::AtomicStore;
use skein_store::StoreCommand;
use skein_time::TimeProvider;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::scripts::ReviveExpired;
use crate::config::CoordinationConfig;
use crate::constants::MAX_MONITOR_BATCH;
use crate::error::CoordinationError;
use crate::keys::KeySpace;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Entries moved from in-flight to ready.
    pub revived: u64,
    /// Ready collection size after the sweep.
    pub ready: u64,
    /// `ready` exceeded the channel threshold.
    pub over_threshold: bool,
}

/// Current size of a channel's collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub ready: u64,
    pub in_flight: u64,
}

/// Sweeps channels for expired leases.
pub struct QueueMonitor<S: AtomicStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn TimeProvider>,
    keys: KeySpace,
    config: Arc<CoordinationConfig>,
}

impl<S: AtomicStore + ?Sized> Clone for QueueMonitor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            keys: self.keys.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: AtomicStore + ?Sized + 'static> QueueMonitor<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn TimeProvider>,
        keys: KeySpace,
        config: Arc<CoordinationConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            config,
        }
    }

    /// Revive every expired lease on `channel`.
    ///
    /// Work is done in atomic batches of at most `MAX_MONITOR_BATCH` entries.
    /// Revived scores are distinct and follow deadline order across batches.
    pub async fn sweep(&self, channel: &str) -> Result<SweepReport, CoordinationError> {
        let keys = self.keys.channel(channel);
        let now_ms = self.clock.now_unix_ms();
        let mut revived = 0u64;
        let mut total = None;

        let ready = loop {
            let script = ReviveExpired {
                ready: keys.ready.clone(),
                in_flight: keys.in_flight.clone(),
                now_ms,
                limit: MAX_MONITOR_BATCH,
                total,
                start: revived,
            };
            let result = self.store.execute(&script).await?;
            let (batch, ready, expired) = match (
                result.get("revived").and_then(|v| v.as_u64()),
                result.get("ready").and_then(|v| v.as_u64()),
                result.get("total").and_then(|v| v.as_u64()),
            ) {
                (Some(batch), Some(ready), Some(expired)) => (batch, ready, expired),
                _ => {
                    return Err(CoordinationError::UnexpectedScriptResult {
                        script: "queue_revive_expired".to_string(),
                        reason: format!("malformed result {result}"),
                    });
                }
            };
            total = Some(expired);
            revived = revived.saturating_add(batch);
            if batch < u64::from(MAX_MONITOR_BATCH) {
                break ready;
            }
        };

        let threshold = self.config.channel(channel).threshold;
        let over_threshold = threshold > 0 && ready > threshold;
        if over_threshold {
            warn!(channel = %channel, ready, threshold, "ready backlog over threshold");
        }
        if revived > 0 {
            debug!(channel = %channel, revived, ready, "expired leases revived");
        }
        Ok(SweepReport {
            revived,
            ready,
            over_threshold,
        })
    }

    pub async fn stats(&self, channel: &str) -> Result<ChannelStats, CoordinationError> {
        let keys = self.keys.channel(channel);
        let ready = self.store.command(StoreCommand::zcard(&keys.ready)).await?.into_integer()?;
        let in_flight = self.store.command(StoreCommand::zcard(&keys.in_flight)).await?.into_integer()?;
        Ok(ChannelStats {
            ready: ready.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
        })
    }

    /// Sweep `channel` every visibility timeout (or poll interval when the
    /// channel is not leased), starting now.
    pub fn start(&self, channel: &str) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let monitor = self.clone();
        let name = channel.to_string();
        let period_ms = self.config.channel(channel).monitor_period_ms().max(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(period_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.sweep(&name).await {
                            warn!(channel = %name, error = %e, "monitor sweep failed");
                        }
                    }
                }
            }
            info!(channel = %name, "monitor stopped");
        });
        info!(channel = %channel, period_ms, "monitor started");

        MonitorHandle {
            cancel,
            task: Some(task),
        }
    }
}

/// Handle to a running monitor. Dropping it stops the monitor.
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
