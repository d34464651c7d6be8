use cardsmith_domain::model::{
    ApplyOutcome, Credits, NewPayment, PaymentId, PaymentRecord, PaymentStatus, UserId,
};
use cardsmith_domain::storage::{PaymentStore, StorageError, StorageResult};
use chrono::Utc;
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait};

use crate::balance_store::{add_to_balance, ensure_non_negative};
use crate::entity::payments::{self, PaymentStatusDb};
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl PaymentStore for SeaOrmStorage {
    async fn record_payment(&self, payment: NewPayment) -> StorageResult<PaymentRecord> {
        ensure_non_negative(payment.credits)?;
        if self.find_payment(&payment.payment_id).await?.is_some() {
            return Err(StorageError::Conflict(format!(
                "payment {} already recorded",
                payment.payment_id
            )));
        }
        let payment_id = payment.payment_id.clone();
        let model = payments::ActiveModel {
            payment_id: Set(payment.payment_id.into_inner()),
            user_id: Set(payment.user_id.get()),
            amount_minor: Set(payment.amount_minor),
            currency: Set(payment.currency),
            credits: Set(payment.credits),
            status: Set(PaymentStatusDb::Pending),
            created_at: Set(Utc::now()),
            completed_at: Set(None),
        };
        if let Err(err) = payments::Entity::insert(model)
            .exec_without_returning(self.connection())
            .await
        {
            // A concurrent insert of the same id loses on the primary key.
            if self.find_payment(&payment_id).await?.is_some() {
                return Err(StorageError::Conflict(format!(
                    "payment {payment_id} already recorded"
                )));
            }
            return Err(StorageError::from_source(err));
        }
        self.find_payment(&payment_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("payment {payment_id}")))
    }

    async fn apply_payment_success(
        &self,
        payment_id: &PaymentId,
        credits: Credits,
    ) -> StorageResult<ApplyOutcome> {
        ensure_non_negative(credits)?;
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;
        let payment = payments::Entity::find_by_id(payment_id.as_str().to_owned())
            .one(&txn)
            .await
            .map_err(StorageError::from_source)?
            .ok_or_else(|| StorageError::NotFound(format!("payment {payment_id}")))?;

        let result = payments::Entity::update_many()
            .col_expr(
                payments::Column::Status,
                Expr::value(PaymentStatusDb::Succeeded),
            )
            .col_expr(payments::Column::CompletedAt, Expr::value(Utc::now()))
            .filter(payments::Column::PaymentId.eq(payment_id.as_str()))
            .filter(payments::Column::Status.eq(PaymentStatusDb::Pending))
            .exec(&txn)
            .await
            .map_err(StorageError::from_source)?;
        if result.rows_affected == 0 {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let user_id = UserId::new(payment.user_id);
        let balance = add_to_balance(&txn, user_id, credits)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user {user_id}")))?;
        txn.commit().await.map_err(StorageError::from_source)?;

        counter!("ledger_payments_total", "status" => "succeeded").increment(1);
        counter!("ledger_credited_total").increment(credits as u64);
        Ok(ApplyOutcome::Applied { user_id, balance })
    }

    async fn mark_payment_closed(
        &self,
        payment_id: &PaymentId,
        status: PaymentStatus,
    ) -> StorageResult<bool> {
        let target = match status {
            PaymentStatus::Cancelled => PaymentStatusDb::Cancelled,
            PaymentStatus::Rejected => PaymentStatusDb::Rejected,
            other => {
                return Err(StorageError::Conflict(format!(
                    "payment cannot be closed as {other}"
                )))
            }
        };
        let result = payments::Entity::update_many()
            .col_expr(payments::Column::Status, Expr::value(target))
            .col_expr(payments::Column::CompletedAt, Expr::value(Utc::now()))
            .filter(payments::Column::PaymentId.eq(payment_id.as_str()))
            .filter(payments::Column::Status.eq(PaymentStatusDb::Pending))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        let closed = result.rows_affected == 1;
        if closed {
            counter!("ledger_payments_total", "status" => status.as_ref().to_owned()).increment(1);
        }
        Ok(closed)
    }

    async fn find_payment(&self, payment_id: &PaymentId) -> StorageResult<Option<PaymentRecord>> {
        let maybe = payments::Entity::find_by_id(payment_id.as_str().to_owned())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(maybe.map(payment_to_record))
    }

    async fn pending_payments(&self) -> StorageResult<Vec<PaymentRecord>> {
        let pending = payments::Entity::find()
            .filter(payments::Column::Status.eq(PaymentStatusDb::Pending))
            .order_by_asc(payments::Column::CreatedAt)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(pending.into_iter().map(payment_to_record).collect())
    }
}

fn payment_to_record(model: payments::Model) -> PaymentRecord {
    PaymentRecord {
        payment_id: PaymentId::new(model.payment_id),
        user_id: UserId::new(model.user_id),
        amount_minor: model.amount_minor,
        currency: model.currency,
        credits: model.credits,
        status: match model.status {
            PaymentStatusDb::Pending => PaymentStatus::Pending,
            PaymentStatusDb::Succeeded => PaymentStatus::Succeeded,
            PaymentStatusDb::Cancelled => PaymentStatus::Cancelled,
            PaymentStatusDb::Rejected => PaymentStatus::Rejected,
        },
        created_at: model.created_at,
        completed_at: model.completed_at,
    }
}
