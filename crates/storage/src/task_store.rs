use std::str::FromStr;

use cardsmith_domain::model::{
    FinalizeOutcome, NewTask, TaskId, TaskKind, TaskRecord, TaskResolution, TaskStatus, UserId,
};
use cardsmith_domain::storage::{StorageError, StorageResult, TaskStore};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use tracing::debug;

use crate::balance_store::{add_to_balance, ensure_non_negative};
use crate::entity::tasks::{self, TaskStatusDb};
use crate::SeaOrmStorage;

const OPEN_STATUSES: [TaskStatusDb; 2] = [TaskStatusDb::Pending, TaskStatusDb::Processing];
const TERMINAL_STATUSES: [TaskStatusDb; 2] = [TaskStatusDb::Completed, TaskStatusDb::Failed];

#[async_trait::async_trait]
impl TaskStore for SeaOrmStorage {
    async fn create_task(&self, task: NewTask) -> StorageResult<TaskId> {
        ensure_non_negative(task.cost)?;
        let input_params =
            serde_json::to_string(&task.input_params).map_err(StorageError::from_source)?;
        let model = tasks::ActiveModel {
            user_id: Set(task.user_id.get()),
            kind: Set(task.kind.as_ref().to_owned()),
            status: Set(TaskStatusDb::Pending),
            cost: Set(task.cost),
            input_params: Set(input_params),
            result_refs: Set(None),
            error: Set(None),
            created_at: Set(Utc::now()),
            completed_at: Set(None),
            ..Default::default()
        };
        let inserted = tasks::Entity::insert(model)
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        counter!("ledger_tasks_created_total", "kind" => task.kind.as_ref().to_owned())
            .increment(1);
        Ok(TaskId::new(inserted.last_insert_id))
    }

    async fn mark_processing(&self, task_id: TaskId) -> StorageResult<bool> {
        let result = tasks::Entity::update_many()
            .col_expr(tasks::Column::Status, Expr::value(TaskStatusDb::Processing))
            .filter(tasks::Column::Id.eq(task_id.get()))
            .filter(tasks::Column::Status.eq(TaskStatusDb::Pending))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected == 1)
    }

    async fn finalize_task(
        &self,
        task_id: TaskId,
        resolution: TaskResolution,
    ) -> StorageResult<FinalizeOutcome> {
        let txn = self
            .connection()
            .begin()
            .await
            .map_err(StorageError::from_source)?;
        let Some(task) = tasks::Entity::find_by_id(task_id.get())
            .one(&txn)
            .await
            .map_err(StorageError::from_source)?
        else {
            return Ok(FinalizeOutcome::Missing);
        };

        let now = Utc::now();
        let (status, result_refs, error) = match &resolution {
            TaskResolution::Completed { result_refs } => (
                TaskStatusDb::Completed,
                Some(serde_json::to_string(result_refs).map_err(StorageError::from_source)?),
                None,
            ),
            TaskResolution::Failed { error } => (TaskStatusDb::Failed, None, Some(error.clone())),
        };
        let result = tasks::Entity::update_many()
            .col_expr(tasks::Column::Status, Expr::value(status))
            .col_expr(tasks::Column::ResultRefs, Expr::value(result_refs))
            .col_expr(tasks::Column::Error, Expr::value(error))
            .col_expr(tasks::Column::CompletedAt, Expr::value(now))
            .filter(tasks::Column::Id.eq(task_id.get()))
            .filter(tasks::Column::Status.is_in(OPEN_STATUSES))
            .exec(&txn)
            .await
            .map_err(StorageError::from_source)?;
        if result.rows_affected == 0 {
            debug!(task_id = %task_id, "task already terminal");
            return Ok(FinalizeOutcome::AlreadyTerminal);
        }

        let refunded = if status == TaskStatusDb::Failed && task.cost > 0 {
            add_to_balance(&txn, UserId::new(task.user_id), task.cost)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("user {}", task.user_id)))?;
            task.cost
        } else {
            0
        };
        txn.commit().await.map_err(StorageError::from_source)?;

        counter!(
            "ledger_tasks_finalized_total",
            "status" => resolution.status().as_ref().to_owned()
        )
        .increment(1);
        if refunded > 0 {
            counter!("ledger_refunded_credits_total").increment(refunded as u64);
        }
        Ok(FinalizeOutcome::Finalized { refunded })
    }

    async fn find_task(&self, task_id: TaskId) -> StorageResult<Option<TaskRecord>> {
        tasks::Entity::find_by_id(task_id.get())
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .map(task_to_record)
            .transpose()
    }

    async fn stale_tasks(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<TaskRecord>> {
        tasks::Entity::find()
            .filter(tasks::Column::Status.is_in(OPEN_STATUSES))
            .filter(tasks::Column::CreatedAt.lt(cutoff))
            .order_by_asc(tasks::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .into_iter()
            .map(task_to_record)
            .collect()
    }

    async fn cleanup_tasks(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let result = tasks::Entity::delete_many()
            .filter(tasks::Column::Status.is_in(TERMINAL_STATUSES))
            .filter(tasks::Column::CompletedAt.lt(cutoff))
            .exec(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        Ok(result.rows_affected)
    }
}

fn task_to_record(model: tasks::Model) -> StorageResult<TaskRecord> {
    let kind = TaskKind::from_str(&model.kind)
        .map_err(|_| StorageError::Database(format!("unknown task kind `{}`", model.kind)))?;
    let input_params =
        serde_json::from_str(&model.input_params).map_err(StorageError::from_source)?;
    let result_refs = model
        .result_refs
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(StorageError::from_source)?;

    Ok(TaskRecord {
        id: TaskId::new(model.id),
        user_id: UserId::new(model.user_id),
        kind,
        status: match model.status {
            TaskStatusDb::Pending => TaskStatus::Pending,
            TaskStatusDb::Processing => TaskStatus::Processing,
            TaskStatusDb::Completed => TaskStatus::Completed,
            TaskStatusDb::Failed => TaskStatus::Failed,
        },
        cost: model.cost,
        input_params,
        result_refs,
        error: model.error,
        created_at: model.created_at,
        completed_at: model.completed_at,
    })
}
