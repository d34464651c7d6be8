use cardsmith_domain::storage::{StorageError, StorageResult};

use crate::{connect_options, SeaOrmStorage};

#[derive(Debug, Default)]
pub struct StorageBuilder {
    database_url: Option<String>,
    max_connections: Option<u32>,
}

impl StorageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Ignored for in-memory SQLite, which always uses one connection.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub async fn build(self) -> StorageResult<SeaOrmStorage> {
        let url = self
            .database_url
            .ok_or_else(|| StorageError::Database("missing database url".into()))?;
        SeaOrmStorage::open(connect_options(&url, self.max_connections)).await
    }
}
