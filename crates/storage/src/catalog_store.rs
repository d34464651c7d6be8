use std::str::FromStr;

use cardsmith_domain::model::{CatalogEntry, CatalogKind, NewCatalogEntry};
use cardsmith_domain::storage::{CatalogStore, StorageError, StorageResult};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};

use crate::entity::catalog_entries;
use crate::SeaOrmStorage;

#[async_trait::async_trait]
impl CatalogStore for SeaOrmStorage {
    async fn catalog_entries(&self, kind: CatalogKind) -> StorageResult<Vec<CatalogEntry>> {
        catalog_entries::Entity::find()
            .filter(catalog_entries::Column::Kind.eq(kind.as_ref()))
            .filter(catalog_entries::Column::IsActive.eq(true))
            .order_by_asc(catalog_entries::Column::Position)
            .order_by_asc(catalog_entries::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .into_iter()
            .map(entry_to_record)
            .collect()
    }

    async fn catalog_group(
        &self,
        kind: CatalogKind,
        group_id: i64,
    ) -> StorageResult<Vec<CatalogEntry>> {
        catalog_entries::Entity::find()
            .filter(catalog_entries::Column::Kind.eq(kind.as_ref()))
            .filter(catalog_entries::Column::GroupId.eq(group_id))
            .filter(catalog_entries::Column::IsActive.eq(true))
            .order_by_asc(catalog_entries::Column::Position)
            .order_by_asc(catalog_entries::Column::Id)
            .all(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .into_iter()
            .map(entry_to_record)
            .collect()
    }

    async fn catalog_entry(&self, id: i64) -> StorageResult<Option<CatalogEntry>> {
        catalog_entries::Entity::find_by_id(id)
            .one(self.connection())
            .await
            .map_err(StorageError::from_source)?
            .map(entry_to_record)
            .transpose()
    }

    async fn insert_catalog_entry(&self, entry: NewCatalogEntry) -> StorageResult<CatalogEntry> {
        let model = catalog_entries::ActiveModel {
            kind: Set(entry.kind.as_ref().to_owned()),
            group_id: Set(entry.group_id),
            group_title: Set(entry.group_title),
            title: Set(entry.title),
            prompt: Set(entry.prompt),
            is_active: Set(entry.is_active),
            position: Set(entry.position),
            ..Default::default()
        };
        let created = model
            .insert(self.connection())
            .await
            .map_err(StorageError::from_source)?;
        entry_to_record(created)
    }
}

fn entry_to_record(model: catalog_entries::Model) -> StorageResult<CatalogEntry> {
    let kind = CatalogKind::from_str(&model.kind)
        .map_err(|_| StorageError::Database(format!("unknown catalog kind `{}`", model.kind)))?;
    Ok(CatalogEntry {
        id: model.id,
        kind,
        group_id: model.group_id,
        group_title: model.group_title,
        title: model.title,
        prompt: model.prompt,
        is_active: model.is_active,
        position: model.position,
    })
}
