use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};
use tracing::{debug, error, info, warn};

use super::adapters::{EntitlementSync, NotificationSink};
use super::catalog::Tariff;
use super::models::Grant;

/// key: side-effect-jobs -> best-effort work queued after a ledger commit
#[derive(Debug, Clone)]
pub enum SideEffectJob {
    NotifyActivation {
        user_id: i64,
        locale: Option<String>,
        tariff: Tariff,
        amount: i64,
        grant: Grant,
    },
    SyncEntitlement {
        user_id: i64,
        grant: Grant,
    },
    /// Reply to a bot command or a failed payment.
    SendText {
        chat_id: i64,
        text: String,
    },
}

impl SideEffectJob {
    fn kind(&self) -> &'static str {
        match self {
            SideEffectJob::NotifyActivation { .. } => "notify_activation",
            SideEffectJob::SyncEntitlement { .. } => "sync_entitlement",
            SideEffectJob::SendText { .. } => "send_text",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("side-effect queue is full, dropped {0} job")]
    QueueFull(&'static str),
    #[error("side-effect worker has stopped, dropped {0} job")]
    Closed(&'static str),
}

/// key: side-effect-handle -> non-blocking enqueue interface
#[derive(Clone)]
pub struct DispatchHandle {
    sender: Sender<SideEffectJob>,
}

impl DispatchHandle {
    /// A handle without a worker; the receiver side is returned to the caller.
    pub fn detached(capacity: usize) -> (Self, Receiver<SideEffectJob>) {
        let (tx, rx) = channel(capacity.max(1));
        (Self { sender: tx }, rx)
    }

    /// Never waits: a full or closed queue drops the job and reports it.
    pub fn enqueue(&self, job: SideEffectJob) -> Result<(), DispatchError> {
        let kind = job.kind();
        self.sender.try_send(job).map_err(|err| match err {
            TrySendError::Full(_) => DispatchError::QueueFull(kind),
            TrySendError::Closed(_) => DispatchError::Closed(kind),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncRetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for SyncRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl SyncRetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

pub fn start_dispatch_worker(
    notifier: Arc<dyn NotificationSink>,
    sync: Option<Arc<dyn EntitlementSync>>,
    policy: SyncRetryPolicy,
    capacity: usize,
) -> DispatchHandle {
    let (handle, mut rx) = DispatchHandle::detached(capacity);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                SideEffectJob::NotifyActivation {
                    user_id,
                    locale,
                    tariff,
                    amount,
                    grant,
                } => {
                    match notifier
                        .notify_activation(user_id, locale.as_deref(), &tariff, amount, &grant)
                        .await
                    {
                        Ok(()) => info!(
                            user_id,
                            transaction_id = %grant.transaction_id,
                            "activation notification delivered"
                        ),
                        Err(err) => warn!(
                            ?err,
                            user_id,
                            transaction_id = %grant.transaction_id,
                            "failed to deliver activation notification",
                        ),
                    }
                }
                SideEffectJob::SyncEntitlement { user_id, grant } => {
                    let Some(sync) = sync.clone() else {
                        debug!(user_id, "entitlement sync disabled, skipping");
                        continue;
                    };
                    // retries sleep; keep them off the queue loop
                    tokio::spawn(sync_with_retry(sync, policy, user_id, grant));
                }
                SideEffectJob::SendText { chat_id, text } => {
                    if let Err(err) = notifier.send_text(chat_id, &text).await {
                        warn!(?err, chat_id, "failed to deliver chat reply");
                    }
                }
            }
        }
    });

    handle
}

async fn sync_with_retry(
    sync: Arc<dyn EntitlementSync>,
    policy: SyncRetryPolicy,
    user_id: i64,
    grant: Grant,
) {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match sync.push_entitlement(user_id, &grant).await {
            Ok(()) => {
                info!(
                    user_id,
                    transaction_id = %grant.transaction_id,
                    attempt,
                    "entitlement synced to external consumer"
                );
                return;
            }
            Err(err) if attempt < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    ?err,
                    user_id,
                    transaction_id = %grant.transaction_id,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    "entitlement sync failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(
                    ?err,
                    user_id,
                    transaction_id = %grant.transaction_id,
                    attempt,
                    "entitlement sync gave up"
                );
            }
        }
    }
}
