use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{
    ApplyOutcome, CatalogEntry, CatalogKind, Credits, FinalizeOutcome, LedgerStats,
    NewCatalogEntry, NewPayment, NewTask, PaymentId, PaymentRecord, PaymentStatus,
    ReserveOutcome, TaskId, TaskRecord, TaskResolution, UserId, UserProfile, UserRecord,
};

/// Common result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("amount must not be negative: {0}")]
    InvalidAmount(Credits),
}

impl StorageError {
    pub fn from_source(err: impl std::fmt::Display) -> Self {
        Self::Database(err.to_string())
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Upserts identity fields and refreshes `last_seen`; never touches the balance.
    async fn get_or_create_user(&self, profile: UserProfile) -> StorageResult<UserRecord>;
    async fn find_user(&self, user_id: UserId) -> StorageResult<Option<UserRecord>>;
    async fn find_user_by_username(&self, username: &str) -> StorageResult<Option<UserRecord>>;
    async fn set_banned(&self, user_id: UserId, banned: bool) -> StorageResult<Option<UserRecord>>;
    async fn ledger_stats(&self) -> StorageResult<LedgerStats>;
}

/// Atomic balance primitives. No other code path mutates a balance.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Decrements the balance by `cost` only if it stays non-negative.
    async fn reserve(&self, user_id: UserId, cost: Credits) -> StorageResult<ReserveOutcome>;
    /// Returns the balance after the increment.
    async fn refund(&self, user_id: UserId, amount: Credits) -> StorageResult<Credits>;
    /// Returns the balance after the increment.
    async fn credit(&self, user_id: UserId, amount: Credits) -> StorageResult<Credits>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: NewTask) -> StorageResult<TaskId>;
    /// PENDING -> PROCESSING; returns `false` when the task was not pending.
    async fn mark_processing(&self, task_id: TaskId) -> StorageResult<bool>;
    /// Single-shot terminal write. A failure refunds the task cost in the same
    /// transaction; repeated calls are no-ops.
    async fn finalize_task(
        &self,
        task_id: TaskId,
        resolution: TaskResolution,
    ) -> StorageResult<FinalizeOutcome>;
    async fn find_task(&self, task_id: TaskId) -> StorageResult<Option<TaskRecord>>;
    /// Non-terminal tasks created before `cutoff`.
    async fn stale_tasks(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<TaskRecord>>;
    /// Deletes terminal tasks completed before `cutoff`; returns the number removed.
    async fn cleanup_tasks(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts a pending payment; fails with `Conflict` when the id exists.
    async fn record_payment(&self, payment: NewPayment) -> StorageResult<PaymentRecord>;
    /// pending -> succeeded plus the balance credit, in one transaction.
    async fn apply_payment_success(
        &self,
        payment_id: &PaymentId,
        credits: Credits,
    ) -> StorageResult<ApplyOutcome>;
    /// pending -> cancelled/rejected; returns `false` when already terminal.
    async fn mark_payment_closed(
        &self,
        payment_id: &PaymentId,
        status: PaymentStatus,
    ) -> StorageResult<bool>;
    async fn find_payment(&self, payment_id: &PaymentId) -> StorageResult<Option<PaymentRecord>>;
    async fn pending_payments(&self) -> StorageResult<Vec<PaymentRecord>>;
}

/// Read side of the prompt catalog; CRUD belongs to the admin tooling.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Active entries of a kind, ordered by position.
    async fn catalog_entries(&self, kind: CatalogKind) -> StorageResult<Vec<CatalogEntry>>;
    async fn catalog_group(
        &self,
        kind: CatalogKind,
        group_id: i64,
    ) -> StorageResult<Vec<CatalogEntry>>;
    async fn catalog_entry(&self, id: i64) -> StorageResult<Option<CatalogEntry>>;
    async fn insert_catalog_entry(&self, entry: NewCatalogEntry) -> StorageResult<CatalogEntry>;
}

/// Everything the orchestrator and reconciler need from the ledger.
pub trait Ledger: UserStore + BalanceStore + TaskStore + PaymentStore + CatalogStore {}

impl<T> Ledger for T where T: UserStore + BalanceStore + TaskStore + PaymentStore + CatalogStore {}
