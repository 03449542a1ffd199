//! Links table migration
//!
//! Creates the `links` table: the authoritative short-code to destination
//! mapping. Rows are inserted by the reconciler draining the pending-write
//! ledger, never synchronously on the create path.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Links::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Links::Code)
                            .string_len(255)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Links::LongUrl).text().not_null())
                    .col(ColumnDef::new(Links::OwnerId).string_len(255).not_null())
                    .col(ColumnDef::new(Links::Topic).string_len(255).null())
                    .col(
                        ColumnDef::new(Links::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Links::LastAccessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_links_owner_id")
                    .table(Links::Table)
                    .col(Links::OwnerId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_links_topic")
                    .table(Links::Table)
                    .col(Links::Topic)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_links_topic").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_links_owner_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Links::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Links {
    #[sea_orm(iden = "links")]
    Table,
    Code,
    LongUrl,
    OwnerId,
    Topic,
    CreatedAt,
    LastAccessedAt,
}
