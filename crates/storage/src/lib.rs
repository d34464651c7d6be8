//! SeaORM-backed ledger that satisfies the domain storage traits while keeping
//! the database backend swappable (SQLite by default, PostgreSQL via feature
//! flag). Every balance mutation is a single conditional UPDATE or runs inside
//! a transaction together with the state change that justifies it.

mod balance_store;
mod builder;
mod catalog_store;
mod entity;
mod migration;
mod payment_store;
mod task_store;
mod user_store;


use std::sync::Arc;
use std::time::Duration;

use cardsmith_domain::storage::{StorageError, StorageResult};
use migration::run_migrations;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub use builder::StorageBuilder;

/// Shared storage handle used by the gateway, orchestrator and reconciler.
#[derive(Clone)]
pub struct SeaOrmStorage {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStorage {
    /// Connects to the provided database URL and ensures the schema is present.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::builder().database_url(database_url).build().await
    }

    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    pub(crate) async fn open(options: ConnectOptions) -> StorageResult<Self> {
        let db = Database::connect(options)
            .await
            .map_err(StorageError::from_source)?;
        run_migrations(&db).await?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        self.db.as_ref()
    }
}

/// In-memory SQLite lives per connection, so such URLs are pinned to a
/// single pooled connection.
pub(crate) fn connect_options(url: &str, max_connections: Option<u32>) -> ConnectOptions {
    let mut options = ConnectOptions::new(url.to_owned());
    options
        .sqlx_logging(false)
        .acquire_timeout(Duration::from_secs(30));
    if url.contains(":memory:") || url.contains("mode=memory") {
        options.max_connections(1).min_connections(1);
    } else if let Some(max) = max_connections {
        options.max_connections(max);
    }
    options
}
