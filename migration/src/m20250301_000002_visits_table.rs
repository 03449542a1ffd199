//! Visits table migration
//!
//! Creates the `visits` table: the append-only exact ledger of visit facts.
//! `fact_key` is unique so re-running a partially failed reconciliation batch
//! cannot insert the same staged fact twice.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Visits::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Visits::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Visits::FactKey)
                            .string_len(255)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Visits::Code).string_len(255).not_null())
                    .col(ColumnDef::new(Visits::VisitorIp).string_len(45).not_null())
                    .col(ColumnDef::new(Visits::UserAgent).text().null())
                    .col(ColumnDef::new(Visits::DeviceType).string_len(50).null())
                    .col(ColumnDef::new(Visits::OsType).string_len(100).null())
                    .col(ColumnDef::new(Visits::Browser).string_len(100).null())
                    .col(ColumnDef::new(Visits::Country).string_len(2).null())
                    .col(ColumnDef::new(Visits::City).string_len(100).null())
                    .col(
                        ColumnDef::new(Visits::VisitedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_visits_code")
                    .table(Visits::Table)
                    .col(Visits::Code)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_visits_code_time")
                    .table(Visits::Table)
                    .col(Visits::Code)
                    .col(Visits::VisitedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_visits_code_time").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_visits_code").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Visits::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Visits {
    #[sea_orm(iden = "visits")]
    Table,
    Id,
    FactKey,
    Code,
    VisitorIp,
    UserAgent,
    DeviceType,
    OsType,
    Browser,
    Country,
    City,
    VisitedAt,
}
