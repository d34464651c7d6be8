use std::sync::Arc;
use std::time::Duration;

use cardsmith_domain::config::PaymentConfig;
use cardsmith_domain::model::PaymentRecord;
use cardsmith_domain::services::{Notification, Notifier};
use cardsmith_domain::storage::PaymentStore;
use chrono::Utc;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::pipeline::{deliver, process_snapshot, Step};
use crate::provider::PaymentProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchPolicy {
    pub interval: Duration,
    /// Measured from the payment's `created_at`, so a resumed watcher keeps
    /// the original deadline.
    pub timeout: Duration,
}

impl WatchPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn from_config(config: &PaymentConfig) -> Self {
        Self::new(config.poll_interval(), config.confirmation_timeout())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    Settled(Step),
    TimedOut,
}

/// Polls one payment until the provider settles it or its confirmation
/// window closes.
pub struct PaymentWatcher<S: ?Sized, P: ?Sized, N: ?Sized> {
    store: Arc<S>,
    provider: Arc<P>,
    notifier: Arc<N>,
    policy: WatchPolicy,
}

impl<S: ?Sized, P: ?Sized, N: ?Sized> Clone for PaymentWatcher<S, P, N> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            notifier: Arc::clone(&self.notifier),
            policy: self.policy,
        }
    }
}

impl<S, P, N> PaymentWatcher<S, P, N>
where
    S: PaymentStore + ?Sized + 'static,
    P: PaymentProvider + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, provider: Arc<P>, notifier: Arc<N>, policy: WatchPolicy) -> Self {
        Self {
            store,
            provider,
            notifier,
            policy,
        }
    }

    pub fn policy(&self) -> WatchPolicy {
        self.policy
    }

    pub fn spawn(&self, payment: PaymentRecord) -> JoinHandle<WatchExit> {
        let watcher = self.clone();
        tokio::spawn(async move { watcher.watch(payment).await })
    }

    /// Always polls at least once. The timeout notification is only sent when
    /// the deadline was still ahead at start; a watcher resumed after its
    /// deadline polls once for a late success and exits quietly.
    pub async fn watch(&self, payment: PaymentRecord) -> WatchExit {
        let timeout = chrono::Duration::from_std(self.policy.timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let deadline = payment.created_at + timeout;
        let announce_timeout = Utc::now() < deadline;

        gauge!("reconciler_active_watchers").increment(1.0);
        let exit = loop {
            sleep(self.policy.interval).await;

            match self.provider.query_payment(&payment.payment_id).await {
                Ok(snapshot) => {
                    match process_snapshot(
                        self.store.as_ref(),
                        self.notifier.as_ref(),
                        &payment,
                        &snapshot,
                    )
                    .await
                    {
                        Ok(step) if step.is_final() => break WatchExit::Settled(step),
                        Ok(_) => {
                            debug!(payment_id = %payment.payment_id, status = ?snapshot.status, "payment still open");
                        }
                        Err(err) => {
                            warn!(payment_id = %payment.payment_id, ?err, "failed to record payment state");
                        }
                    }
                }
                Err(err) => {
                    counter!("reconciler_payments_total", "result" => "query_error").increment(1);
                    warn!(payment_id = %payment.payment_id, ?err, "payment query failed");
                }
            }

            if Utc::now() >= deadline {
                counter!("reconciler_payments_total", "result" => "timeout").increment(1);
                info!(payment_id = %payment.payment_id, announce_timeout, "payment watch timed out");
                if announce_timeout {
                    deliver(
                        self.notifier.as_ref(),
                        Notification::PaymentTimedOut {
                            user_id: payment.user_id,
                            payment_id: payment.payment_id.clone(),
                        },
                    )
                    .await;
                }
                break WatchExit::TimedOut;
            }
        };
        gauge!("reconciler_active_watchers").decrement(1.0);
        exit
    }
}
