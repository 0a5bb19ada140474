//! Background lease renewal for one in-flight message.

use std::sync::Arc;
use std::time::Duration;

use skein_store::AtomicStore;
use skein_time::TimeProvider;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::scripts::RenewLease;
use crate::verified::heartbeat_period_ms;

/// Renews a lease every `0.8 ×` its duration until stopped or dropped.
///
/// Renewal stops by itself once the entry is no longer in-flight (acked by
/// someone else, or revived by a monitor).
pub(crate) struct LeaseRenewal {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LeaseRenewal {
    pub(crate) fn spawn<S>(
        store: Arc<S>,
        clock: Arc<dyn TimeProvider>,
        in_flight: String,
        member: String,
        lease_ms: u64,
        parent: &CancellationToken,
    ) -> Self
    where
        S: AtomicStore + ?Sized + 'static,
    {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let period = Duration::from_millis(heartbeat_period_ms(lease_ms));

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }

                let deadline_ms = clock.now_unix_ms().saturating_add(lease_ms);
                let script = RenewLease {
                    in_flight: in_flight.clone(),
                    member: member.clone(),
                    deadline_ms,
                };
                match store.execute(&script).await {
                    Ok(value) if value.as_bool() == Some(true) => {
                        debug!(key = %in_flight, deadline_ms, "lease renewed");
                    }
                    Ok(_) => {
                        warn!(key = %in_flight, "lease lost, stopping renewal");
                        break;
                    }
                    Err(e) => {
                        warn!(key = %in_flight, error = %e, "lease renewal failed");
                    }
                }
            }
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Cancel renewal and wait for the task to finish.
    pub(crate) async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LeaseRenewal {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
