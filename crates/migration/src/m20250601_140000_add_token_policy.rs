//! Adds the singleton token policy table.
//!
//! The row itself is seeded by the server on first boot from configured
//! defaults and mutated only through the admin policy API.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TokenPolicy::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TokenPolicy::Id)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TokenPolicy::AccessTtlSecs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenPolicy::RefreshTtlSecs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenPolicy::IdTokenTtlSecs)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TokenPolicy::RefreshRotationEnabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(TokenPolicy::ReuseDetectionEnabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(TokenPolicy::ReuseAction)
                            .string()
                            .not_null()
                            .default("client_subject"),
                    )
                    .col(
                        ColumnDef::new(TokenPolicy::ReuseLeewaySecs)
                            .big_integer()
                            .not_null()
                            .default(30),
                    )
                    .col(
                        ColumnDef::new(TokenPolicy::RowVersion)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(TokenPolicy::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TokenPolicy::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum TokenPolicy {
    Table,
    Id,
    AccessTtlSecs,
    RefreshTtlSecs,
    IdTokenTtlSecs,
    RefreshRotationEnabled,
    ReuseDetectionEnabled,
    ReuseAction,
    ReuseLeewaySecs,
    RowVersion,
    UpdatedAt,
}
