use std::collections::BTreeMap;
use std::sync::Arc;

use cardsmith_domain::model::{Credits, NewPayment, PaymentId, PaymentPackage, UserId};
use cardsmith_domain::services::Notifier;
use cardsmith_domain::storage::{PaymentStore, StorageError};
use cardsmith_domain::{derive_idempotence_key, random_hex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::provider::{PaymentProvider, PaymentRequest, ProviderError};
use crate::watcher::{PaymentWatcher, WatchExit, WatchPolicy};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("payment provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("entropy unavailable: {0}")]
    Entropy(String),
}

/// A freshly created top-up. The watcher keeps running if the handle is
/// dropped.
#[derive(Debug)]
pub struct TopUp {
    pub payment_id: PaymentId,
    pub pay_url: String,
    pub credits: Credits,
    pub watcher: JoinHandle<WatchExit>,
}

pub struct TopUpService<S: ?Sized, P: ?Sized, N: ?Sized> {
    store: Arc<S>,
    provider: Arc<P>,
    watcher: PaymentWatcher<S, P, N>,
    currency: String,
}

impl<S, P, N> TopUpService<S, P, N>
where
    S: PaymentStore + ?Sized + 'static,
    P: PaymentProvider + ?Sized + 'static,
    N: Notifier + ?Sized + 'static,
{
    pub fn new(
        store: Arc<S>,
        provider: Arc<P>,
        notifier: Arc<N>,
        policy: WatchPolicy,
        currency: impl Into<String>,
    ) -> Self {
        let watcher = PaymentWatcher::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            notifier,
            policy,
        );
        Self {
            store,
            provider,
            watcher,
            currency: currency.into(),
        }
    }

    /// Creates the provider payment, records it as pending and starts
    /// watching it.
    pub async fn start(
        &self,
        user_id: UserId,
        package: PaymentPackage,
    ) -> Result<TopUp, ReconcileError> {
        let nonce = random_hex(16).map_err(|err| ReconcileError::Entropy(err.to_string()))?;
        let request = PaymentRequest {
            amount_minor: package.amount_minor,
            currency: self.currency.clone(),
            description: format!("Top-up: {} credits", package.credits),
            metadata: BTreeMap::from([
                ("user_id".to_string(), user_id.to_string()),
                ("credits".to_string(), package.credits.to_string()),
            ]),
            idempotence_key: derive_idempotence_key(user_id, &package, &nonce),
        };
        let created = self.provider.create_payment(&request).await?;

        let record = self
            .store
            .record_payment(NewPayment {
                payment_id: created.payment_id.clone(),
                user_id,
                amount_minor: package.amount_minor,
                currency: self.currency.clone(),
                credits: package.credits,
            })
            .await?;
        info!(
            payment_id = %record.payment_id,
            %user_id,
            amount_minor = package.amount_minor,
            credits = package.credits,
            "payment created"
        );

        Ok(TopUp {
            payment_id: created.payment_id,
            pay_url: created.confirmation_url,
            credits: package.credits,
            watcher: self.watcher.spawn(record),
        })
    }

    /// Re-attaches watchers to every payment left pending by a previous run.
    pub async fn resume_pending(&self) -> Result<Vec<JoinHandle<WatchExit>>, ReconcileError> {
        let pending = self.store.pending_payments().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "resuming payment watchers");
        }
        Ok(pending
            .into_iter()
            .map(|payment| self.watcher.spawn(payment))
            .collect())
    }
}
