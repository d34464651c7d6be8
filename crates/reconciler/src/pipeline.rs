use cardsmith_domain::model::{ApplyOutcome, PaymentRecord, PaymentStatus};
use cardsmith_domain::services::{Notification, Notifier};
use cardsmith_domain::storage::PaymentStore;
use metrics::counter;
use tracing::{info, warn};

use crate::provider::{PaymentSnapshot, ProviderStatus};
use crate::topup::ReconcileError;

/// What one provider observation did to the local payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Still open at the provider; poll again.
    Pending,
    /// Credits were applied by this call.
    Applied,
    /// The payment was already terminal locally; nothing changed.
    AlreadySettled,
    /// The provider closed the payment without capturing funds.
    Closed(PaymentStatus),
}

impl Step {
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Pending)
    }

    fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::AlreadySettled => "already_settled",
            Self::Closed(_) => "closed",
        }
    }
}

/// Folds one provider snapshot into the ledger. Crediting goes through
/// `apply_payment_success`, so replaying the same snapshot is harmless and the
/// user hears about a success only from the call that applied it.
pub async fn process_snapshot<S, N>(
    store: &S,
    notifier: &N,
    payment: &PaymentRecord,
    snapshot: &PaymentSnapshot,
) -> Result<Step, ReconcileError>
where
    S: PaymentStore + ?Sized,
    N: Notifier + ?Sized,
{
    let step = if snapshot.paid || snapshot.status == ProviderStatus::Succeeded {
        match store
            .apply_payment_success(&payment.payment_id, payment.credits)
            .await?
        {
            ApplyOutcome::Applied { user_id, balance } => {
                info!(
                    payment_id = %payment.payment_id,
                    %user_id,
                    credits = payment.credits,
                    balance,
                    "payment applied"
                );
                deliver(
                    notifier,
                    Notification::PaymentSucceeded {
                        user_id,
                        payment_id: payment.payment_id.clone(),
                        credits: payment.credits,
                        balance,
                    },
                )
                .await;
                Step::Applied
            }
            ApplyOutcome::AlreadyApplied => Step::AlreadySettled,
        }
    } else {
        match snapshot.status {
            ProviderStatus::Cancelled | ProviderStatus::Rejected => {
                let status = if snapshot.status == ProviderStatus::Cancelled {
                    PaymentStatus::Cancelled
                } else {
                    PaymentStatus::Rejected
                };
                if store
                    .mark_payment_closed(&payment.payment_id, status)
                    .await?
                {
                    info!(payment_id = %payment.payment_id, %status, "payment closed");
                    deliver(
                        notifier,
                        Notification::PaymentClosed {
                            user_id: payment.user_id,
                            payment_id: payment.payment_id.clone(),
                            status,
                        },
                    )
                    .await;
                    Step::Closed(status)
                } else {
                    Step::AlreadySettled
                }
            }
            _ => Step::Pending,
        }
    };

    counter!("reconciler_payments_total", "result" => step.label()).increment(1);
    Ok(step)
}

/// Notification failures never undo ledger work; they are only logged.
pub(crate) async fn deliver<N: Notifier + ?Sized>(notifier: &N, notification: Notification) {
    let user_id = notification.user_id();
    if let Err(err) = notifier.notify(notification).await {
        warn!(%user_id, ?err, "failed to deliver payment notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cardsmith_domain::model::{NewPayment, PaymentId, UserId, UserProfile};
    use cardsmith_domain::services::NotifyError;
    use cardsmith_domain::storage::UserStore;
    use cardsmith_storage::SeaOrmStorage;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Notification>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(notification);
            Ok(())
        }
    }

    async fn seeded() -> (SeaOrmStorage, PaymentRecord) {
        let storage = SeaOrmStorage::connect("sqlite::memory:").await.unwrap();
        storage
            .get_or_create_user(UserProfile {
                platform_id: UserId::new(42),
                username: Some("buyer".into()),
                full_name: None,
                is_admin: false,
            })
            .await
            .unwrap();
        let payment = storage
            .record_payment(NewPayment {
                payment_id: PaymentId::new("pay-1"),
                user_id: UserId::new(42),
                amount_minor: 29_900,
                currency: "RUB".into(),
                credits: 30,
            })
            .await
            .unwrap();
        (storage, payment)
    }

    fn snapshot(status: ProviderStatus, paid: bool) -> PaymentSnapshot {
        PaymentSnapshot {
            status,
            paid,
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn waiting_payment_stays_pending() {
        let (storage, payment) = seeded().await;
        let notifier = Recorder::default();

        let step = process_snapshot(
            &storage,
            &notifier,
            &payment,
            &snapshot(ProviderStatus::WaitingForCapture, false),
        )
        .await
        .unwrap();

        assert_eq!(step, Step::Pending);
        assert!(notifier.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn paid_snapshot_credits_once() {
        let (storage, payment) = seeded().await;
        let notifier = Recorder::default();
        let paid = snapshot(ProviderStatus::Succeeded, true);

        let first = process_snapshot(&storage, &notifier, &payment, &paid).await.unwrap();
        let second = process_snapshot(&storage, &notifier, &payment, &paid).await.unwrap();

        assert_eq!(first, Step::Applied);
        assert_eq!(second, Step::AlreadySettled);
        let user = storage.find_user(UserId::new(42)).await.unwrap().unwrap();
        assert_eq!(user.balance, 30);
        assert_eq!(notifier.0.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_snapshot_closes_without_credit() {
        let (storage, payment) = seeded().await;
        let notifier = Recorder::default();

        let step = process_snapshot(
            &storage,
            &notifier,
            &payment,
            &snapshot(ProviderStatus::Cancelled, false),
        )
        .await
        .unwrap();

        assert_eq!(step, Step::Closed(PaymentStatus::Cancelled));
        let record = storage
            .find_payment(&payment.payment_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, PaymentStatus::Cancelled);
        let user = storage.find_user(UserId::new(42)).await.unwrap().unwrap();
        assert_eq!(user.balance, 0);
        assert!(matches!(
            notifier.0.lock().unwrap().as_slice(),
            [Notification::PaymentClosed { .. }]
        ));

        let replay = process_snapshot(
            &storage,
            &notifier,
            &payment,
            &snapshot(ProviderStatus::Rejected, false),
        )
        .await
        .unwrap();
        assert_eq!(replay, Step::AlreadySettled);
    }
}
