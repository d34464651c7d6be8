//! Startup sweep for orchestrations cut short by a restart, and retention
//! cleanup of settled tasks.

use std::time::Duration;

use cardsmith_domain::model::{Credits, FinalizeOutcome, TaskRecord, TaskResolution};
use cardsmith_domain::storage::{StorageResult, TaskStore};
use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{info, warn};

pub const INTERRUPTED_ERROR: &str = "interrupted by a service restart";

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredTask {
    pub task: TaskRecord,
    pub refunded: Credits,
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(36_500));
    Utc::now() - age
}

/// Fails every non-terminal task older than `window`, refunding through the
/// single-shot finalize. Running it twice refunds nothing the second time.
pub async fn recover_stale_tasks<S>(store: &S, window: Duration) -> StorageResult<Vec<RecoveredTask>>
where
    S: TaskStore + ?Sized,
{
    let stale = store.stale_tasks(cutoff(window)).await?;
    let mut recovered = Vec::with_capacity(stale.len());
    for task in stale {
        let outcome = store
            .finalize_task(
                task.id,
                TaskResolution::Failed {
                    error: INTERRUPTED_ERROR.into(),
                },
            )
            .await?;
        match outcome {
            FinalizeOutcome::Finalized { refunded } => {
                counter!("orchestrator_recovered_tasks_total").increment(1);
                info!(task_id = %task.id, user_id = %task.user_id, refunded, "stale task failed");
                recovered.push(RecoveredTask { task, refunded });
            }
            other => warn!(task_id = %task.id, ?other, "stale task settled concurrently"),
        }
    }
    Ok(recovered)
}

/// Deletes settled tasks whose completion is older than `retention`. Open
/// tasks are never touched.
pub async fn cleanup_expired_tasks<S>(store: &S, retention: Duration) -> StorageResult<u64>
where
    S: TaskStore + ?Sized,
{
    let removed = store.cleanup_tasks(cutoff(retention)).await?;
    if removed > 0 {
        counter!("orchestrator_purged_tasks_total").increment(removed);
        info!(removed, "expired tasks purged");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardsmith_domain::model::{NewTask, TaskKind, TaskStatus, UserId, UserProfile};
    use cardsmith_domain::storage::{BalanceStore, UserStore};
    use cardsmith_storage::SeaOrmStorage;
    use serde_json::json;

    #[tokio::test]
    async fn sweep_refunds_interrupted_tasks_once() {
        let storage = SeaOrmStorage::connect("sqlite::memory:").await.unwrap();
        let user = UserId::new(77);
        storage
            .get_or_create_user(UserProfile {
                platform_id: user,
                username: None,
                full_name: None,
                is_admin: false,
            })
            .await
            .unwrap();
        storage.credit(user, 5).await.unwrap();
        storage.reserve(user, 3).await.unwrap();
        let task = storage
            .create_task(NewTask {
                user_id: user,
                kind: TaskKind::PhotoScene,
                cost: 3,
                input_params: json!({}),
            })
            .await
            .unwrap();
        storage.mark_processing(task).await.unwrap();

        // A long window leaves the fresh task alone.
        assert!(recover_stale_tasks(&storage, Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        let recovered = recover_stale_tasks(&storage, Duration::ZERO).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].refunded, 3);
        assert!(recover_stale_tasks(&storage, Duration::ZERO)
            .await
            .unwrap()
            .is_empty());

        let record = storage.find_task(task).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error.as_deref(), Some(INTERRUPTED_ERROR));
        assert_eq!(storage.find_user(user).await.unwrap().unwrap().balance, 5);

        assert_eq!(
            cleanup_expired_tasks(&storage, Duration::from_secs(3600))
                .await
                .unwrap(),
            0
        );
    }
}
