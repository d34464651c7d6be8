use sea_orm::sea_query::{ColumnDef, Index, IndexCreateStatement, Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, DatabaseConnection};

use crate::entity::{catalog_entries, payments, tasks, users};
use cardsmith_domain::storage::{StorageError, StorageResult};

pub async fn run_migrations(db: &DatabaseConnection) -> StorageResult<()> {
    let users_table = Table::create()
        .table(users::Entity)
        .col(
            ColumnDef::new(users::Column::PlatformId)
                .big_integer()
                .not_null()
                .primary_key(),
        )
        .col(ColumnDef::new(users::Column::Username).string_len(64).null())
        .col(ColumnDef::new(users::Column::FullName).string_len(256).null())
        .col(
            ColumnDef::new(users::Column::Balance)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(users::Column::IsAdmin)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(
            ColumnDef::new(users::Column::IsBanned)
                .boolean()
                .not_null()
                .default(false),
        )
        .col(
            ColumnDef::new(users::Column::FirstSeen)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(users::Column::LastSeen)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned();
    create_table(db, users_table).await?;

    let tasks_table = Table::create()
        .table(tasks::Entity)
        .col(
            ColumnDef::new(tasks::Column::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(tasks::Column::UserId).big_integer().not_null())
        .col(ColumnDef::new(tasks::Column::Kind).string_len(32).not_null())
        .col(ColumnDef::new(tasks::Column::Status).tiny_integer().not_null())
        .col(ColumnDef::new(tasks::Column::Cost).big_integer().not_null())
        .col(ColumnDef::new(tasks::Column::InputParams).text().not_null())
        .col(ColumnDef::new(tasks::Column::ResultRefs).text().null())
        .col(ColumnDef::new(tasks::Column::Error).text().null())
        .col(
            ColumnDef::new(tasks::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(tasks::Column::CompletedAt)
                .timestamp_with_time_zone()
                .null(),
        )
        .to_owned();
    create_table(db, tasks_table).await?;

    let payments_table = Table::create()
        .table(payments::Entity)
        .col(
            ColumnDef::new(payments::Column::PaymentId)
                .string_len(64)
                .not_null()
                .primary_key(),
        )
        .col(
            ColumnDef::new(payments::Column::UserId)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(payments::Column::AmountMinor)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(payments::Column::Currency)
                .string_len(8)
                .not_null(),
        )
        .col(
            ColumnDef::new(payments::Column::Credits)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(payments::Column::Status)
                .tiny_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(payments::Column::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(payments::Column::CompletedAt)
                .timestamp_with_time_zone()
                .null(),
        )
        .to_owned();
    create_table(db, payments_table).await?;

    let catalog_table = Table::create()
        .table(catalog_entries::Entity)
        .col(
            ColumnDef::new(catalog_entries::Column::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(catalog_entries::Column::Kind)
                .string_len(32)
                .not_null(),
        )
        .col(
            ColumnDef::new(catalog_entries::Column::GroupId)
                .big_integer()
                .null(),
        )
        .col(
            ColumnDef::new(catalog_entries::Column::GroupTitle)
                .string_len(128)
                .null(),
        )
        .col(
            ColumnDef::new(catalog_entries::Column::Title)
                .string_len(128)
                .not_null(),
        )
        .col(ColumnDef::new(catalog_entries::Column::Prompt).text().not_null())
        .col(
            ColumnDef::new(catalog_entries::Column::IsActive)
                .boolean()
                .not_null()
                .default(true),
        )
        .col(
            ColumnDef::new(catalog_entries::Column::Position)
                .integer()
                .not_null()
                .default(0),
        )
        .to_owned();
    create_table(db, catalog_table).await?;

    create_index(
        db,
        Index::create()
            .name("idx_tasks_user_id")
            .table(tasks::Entity)
            .col(tasks::Column::UserId)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_tasks_created_at")
            .table(tasks::Entity)
            .col(tasks::Column::CreatedAt)
            .to_owned(),
    )
    .await?;
    create_index(
        db,
        Index::create()
            .name("idx_payments_user_id")
            .table(payments::Entity)
            .col(payments::Column::UserId)
            .to_owned(),
    )
    .await?;

    Ok(())
}

async fn create_table(
    db: &DatabaseConnection,
    mut statement: TableCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    let backend = db.get_database_backend();
    db.execute(backend.build(&statement))
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}

async fn create_index(
    db: &DatabaseConnection,
    mut statement: IndexCreateStatement,
) -> StorageResult<()> {
    statement.if_not_exists();
    let backend = db.get_database_backend();
    db.execute(backend.build(&statement))
        .await
        .map_err(StorageError::from_source)?;
    Ok(())
}
