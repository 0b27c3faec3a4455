//! Adds the signing key table backing the key ring.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SigningKey::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SigningKey::Kid)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SigningKey::Alg)
                            .string()
                            .not_null()
                            .default("ES256"),
                    )
                    .col(ColumnDef::new(SigningKey::PrivatePkcs8).text().not_null())
                    .col(ColumnDef::new(SigningKey::PublicX).string().not_null())
                    .col(ColumnDef::new(SigningKey::PublicY).string().not_null())
                    .col(ColumnDef::new(SigningKey::Status).string().not_null())
                    .col(
                        ColumnDef::new(SigningKey::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SigningKey::ActivatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SigningKey::RetireAfter)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SigningKey::NotBefore)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SigningKey::NotAfter)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SigningKey::RowVersion)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_signing_key_status")
                    .table(SigningKey::Table)
                    .col(SigningKey::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_signing_key_status").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SigningKey::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum SigningKey {
    Table,
    Kid,
    Alg,
    PrivatePkcs8,
    PublicX,
    PublicY,
    Status,
    CreatedAt,
    ActivatedAt,
    RetireAfter,
    NotBefore,
    NotAfter,
    RowVersion,
}
