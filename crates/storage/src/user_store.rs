use cardsmith_domain::model::{LedgerStats, UserId, UserProfile, UserRecord};
use cardsmith_domain::storage::{StorageError, StorageResult, UserStore};
use chrono::Utc;
use sea_orm::sea_query::{Alias, Expr, Func, OnConflict, SimpleExpr};
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, QuerySelect, Set,
};

use crate::entity::payments::{self, PaymentStatusDb};
use crate::entity::tasks::{self, TaskStatusDb};
use crate::entity::users;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl UserStore for SeaOrmStorage {
    async fn get_or_create_user(&self, profile: UserProfile) -> StorageResult<UserRecord> {
        let now = Utc::now();
        let model = users::ActiveModel {
            platform_id: Set(profile.platform_id.get()),
            username: Set(profile.username),
            full_name: Set(profile.full_name),
            balance: Set(0),
            is_admin: Set(profile.is_admin),
            is_banned: Set(false),
            first_seen: Set(now),
            last_seen: Set(now),
        };
        users::Entity::insert(model)
            .on_conflict(
                OnConflict::column(users::Column::PlatformId)
                    .update_columns([
                        users::Column::Username,
                        users::Column::FullName,
                        users::Column::IsAdmin,
                        users::Column::LastSeen,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self.connection())
            .await
            .map_err(StorageError::from_source)?;

        find_user_in(self.connection(), profile.platform_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user {}", profile.platform_id)))
    }

    async fn find_user(&self, user_id: UserId) -> StorageResult<Option<UserRecord>> {
        find_user_in(self.connection(), user_id).await
    }

    async fn find_user_by_username(&self, username: &str) -> StorageResult<Option<UserRecord>> {
        let needle = username.trim().trim_start_matches('@').to_lowercase();
        let maybe = users::Entity::find()
            .filter(Expr::expr(Func::lower(Expr::col(users::Column::Username))).eq(needle))
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(maybe.map(user_to_record))
    }

    async fn set_banned(&self, user_id: UserId, banned: bool) -> StorageResult<Option<UserRecord>> {
        users::Entity::update_many()
            .col_expr(users::Column::IsBanned, Expr::value(banned))
            .filter(users::Column::PlatformId.eq(user_id.get()))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        find_user_in(self.connection(), user_id).await
    }

    async fn ledger_stats(&self) -> StorageResult<LedgerStats> {
        let db = self.connection();
        let users_total = users::Entity::find()
            .count(db)
            .await
            .map_err(StorageError::from_source)?;
        let banned_users = users::Entity::find()
            .filter(users::Column::IsBanned.eq(true))
            .count(db)
            .await
            .map_err(StorageError::from_source)?;
        let outstanding_credits = users::Entity::find()
            .select_only()
            .column_as(big_sum(users::Column::Balance), "total")
            .into_tuple::<Option<i64>>()
            .one(db)
            .await
            .map_err(StorageError::from_source)?
            .flatten()
            .unwrap_or(0);

        let task_counts = tasks::Entity::find()
            .select_only()
            .column(tasks::Column::Status)
            .column_as(Expr::col(tasks::Column::Id).count(), "total")
            .group_by(tasks::Column::Status)
            .into_tuple::<(TaskStatusDb, i64)>()
            .all(db)
            .await
            .map_err(StorageError::from_source)?;

        let (succeeded_payments, credits_sold) = payments::Entity::find()
            .select_only()
            .column_as(Expr::col(payments::Column::PaymentId).count(), "total")
            .column_as(big_sum(payments::Column::Credits), "credits")
            .filter(payments::Column::Status.eq(PaymentStatusDb::Succeeded))
            .into_tuple::<(i64, Option<i64>)>()
            .one(db)
            .await
            .map_err(StorageError::from_source)?
            .unwrap_or((0, None));

        let mut stats = LedgerStats {
            users: users_total,
            banned_users,
            outstanding_credits,
            succeeded_payments: succeeded_payments.max(0) as u64,
            credits_sold: credits_sold.unwrap_or(0),
            ..LedgerStats::default()
        };
        for (status, total) in task_counts {
            let total = total.max(0) as u64;
            match status {
                TaskStatusDb::Pending => stats.pending_tasks = total,
                TaskStatusDb::Processing => stats.processing_tasks = total,
                TaskStatusDb::Completed => stats.completed_tasks = total,
                TaskStatusDb::Failed => stats.failed_tasks = total,
            }
        }
        Ok(stats)
    }
}

/// `SUM` widens to NUMERIC on PostgreSQL; cast back so it decodes as i64.
fn big_sum<C: sea_orm::sea_query::IntoColumnRef>(column: C) -> SimpleExpr {
    Func::cast_as(Func::sum(Expr::col(column)), Alias::new("BIGINT")).into()
}

pub(crate) async fn find_user_in<C: ConnectionTrait>(
    db: &C,
    user_id: UserId,
) -> StorageResult<Option<UserRecord>> {
    let maybe = users::Entity::find_by_id(user_id.get())
        .one(db)
        .await
        .map_err(StorageError::from_source)?;
    Ok(maybe.map(user_to_record))
}

pub(crate) fn user_to_record(model: users::Model) -> UserRecord {
    UserRecord {
        platform_id: UserId::new(model.platform_id),
        username: model.username,
        full_name: model.full_name,
        balance: model.balance,
        is_admin: model.is_admin,
        is_banned: model.is_banned,
        first_seen: model.first_seen,
        last_seen: model.last_seen,
    }
}
