use cardsmith_domain::model::{Credits, ReserveOutcome, UserId};
use cardsmith_domain::storage::{BalanceStore, StorageError, StorageResult};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, TransactionTrait};

use crate::entity::users;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl BalanceStore for SeaOrmStorage {
    async fn reserve(&self, user_id: UserId, cost: Credits) -> StorageResult<ReserveOutcome> {
        ensure_non_negative(cost)?;
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;
        let result = users::Entity::update_many()
            .col_expr(
                users::Column::Balance,
                Expr::col(users::Column::Balance).sub(cost),
            )
            .filter(users::Column::PlatformId.eq(user_id.get()))
            .filter(users::Column::Balance.gte(cost))
            .exec(&txn)
            .await
            .map_err(StorageError::from_source)?;
        let balance = current_balance(&txn, user_id).await?;
        txn.commit().await.map_err(StorageError::from_source)?;

        let outcome = match (result.rows_affected, balance) {
            (1, Some(balance)) => ReserveOutcome::Reserved { balance },
            (_, Some(balance)) => ReserveOutcome::Insufficient { balance },
            (_, None) => ReserveOutcome::UnknownUser,
        };
        let label = match outcome {
            ReserveOutcome::Reserved { .. } => "reserved",
            ReserveOutcome::Insufficient { .. } => "insufficient",
            ReserveOutcome::UnknownUser => "unknown_user",
        };
        counter!("ledger_reservations_total", "result" => label).increment(1);
        Ok(outcome)
    }

    async fn refund(&self, user_id: UserId, amount: Credits) -> StorageResult<Credits> {
        let balance = self.increment(user_id, amount).await?;
        counter!("ledger_refunded_credits_total").increment(amount as u64);
        Ok(balance)
    }

    async fn credit(&self, user_id: UserId, amount: Credits) -> StorageResult<Credits> {
        let balance = self.increment(user_id, amount).await?;
        counter!("ledger_credited_total").increment(amount as u64);
        Ok(balance)
    }
}

impl SeaOrmStorage {
    async fn increment(&self, user_id: UserId, amount: Credits) -> StorageResult<Credits> {
        ensure_non_negative(amount)?;
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;
        let balance = add_to_balance(&txn, user_id, amount)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user {user_id}")))?;
        txn.commit().await.map_err(StorageError::from_source)?;
        Ok(balance)
    }
}

/// Adds `amount` to the balance on the given connection or transaction and
/// returns the new balance, or `None` when the user does not exist.
pub(crate) async fn add_to_balance<C: ConnectionTrait>(
    db: &C,
    user_id: UserId,
    amount: Credits,
) -> StorageResult<Option<Credits>> {
    let result = users::Entity::update_many()
        .col_expr(
            users::Column::Balance,
            Expr::col(users::Column::Balance).add(amount),
        )
        .filter(users::Column::PlatformId.eq(user_id.get()))
        .exec(db)
        .await
        .map_err(StorageError::from_source)?;
    if result.rows_affected == 0 {
        return Ok(None);
    }
    current_balance(db, user_id).await
}

async fn current_balance<C: ConnectionTrait>(
    db: &C,
    user_id: UserId,
) -> StorageResult<Option<Credits>> {
    let maybe = users::Entity::find_by_id(user_id.get())
        .one(db)
        .await
        .map_err(StorageError::from_source)?;
    Ok(maybe.map(|user| user.balance))
}

pub(crate) fn ensure_non_negative(amount: Credits) -> StorageResult<()> {
    if amount < 0 {
        return Err(StorageError::InvalidAmount(amount));
    }
    Ok(())
}
