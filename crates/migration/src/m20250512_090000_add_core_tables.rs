//! Initial schema for the authorization server core.
//!
//! Creates tables for:
//! - client: Registered OAuth2 clients
//! - user: Resource owner accounts (the subject store)
//! - authorization: Consent grants (permanent and ad-hoc)
//! - auth_code: Single-use authorization codes
//! - token: Issued access/refresh token pairs

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 1. Clients table
        manager
            .create_table(
                Table::create()
                    .table(Client::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Client::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Client::Secret).string().null())
                    .col(ColumnDef::new(Client::Name).string().not_null())
                    .col(ColumnDef::new(Client::RedirectUris).text().not_null())
                    .col(
                        ColumnDef::new(Client::GrantTypes)
                            .text()
                            .not_null()
                            .default("authorization_code"),
                    )
                    .col(
                        ColumnDef::new(Client::Scopes)
                            .text()
                            .not_null()
                            .default("openid profile email"),
                    )
                    .col(
                        ColumnDef::new(Client::IsPublic)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Client::RequirePkce)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Client::Enabled)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Client::PasswordGrantEnabled)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Client::PasswordScopes).text().null())
                    .col(
                        ColumnDef::new(Client::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Client::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // 2. Users table (subject store)
        manager
            .create_table(
                Table::create()
                    .table(User::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(User::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(User::Email)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(User::EmailVerified)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(User::Name).string().null())
                    .col(ColumnDef::new(User::PasswordHash).string().null())
                    .col(
                        ColumnDef::new(User::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(User::Anonymized)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(User::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(User::LastLoginAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // 3. Consent grants
        manager
            .create_table(
                Table::create()
                    .table(Authorization::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Authorization::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Authorization::UserId).string().not_null())
                    .col(ColumnDef::new(Authorization::ClientId).string().not_null())
                    .col(ColumnDef::new(Authorization::Kind).string().not_null())
                    .col(ColumnDef::new(Authorization::Scope).text().not_null())
                    .col(
                        ColumnDef::new(Authorization::Status)
                            .string()
                            .not_null()
                            .default("valid"),
                    )
                    .col(
                        ColumnDef::new(Authorization::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Authorization::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // 4. Authorization codes (temporary, single-use)
        manager
            .create_table(
                Table::create()
                    .table(AuthCode::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AuthCode::Code)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AuthCode::ClientId).string().not_null())
                    .col(ColumnDef::new(AuthCode::UserId).string().not_null())
                    .col(ColumnDef::new(AuthCode::AuthorizationId).string().null())
                    .col(ColumnDef::new(AuthCode::RedirectUri).text().not_null())
                    .col(ColumnDef::new(AuthCode::Scope).text().not_null())
                    .col(ColumnDef::new(AuthCode::Nonce).string().null())
                    .col(ColumnDef::new(AuthCode::CodeChallenge).string().null())
                    .col(
                        ColumnDef::new(AuthCode::CodeChallengeMethod)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AuthCode::Status)
                            .string()
                            .not_null()
                            .default("valid"),
                    )
                    .col(
                        ColumnDef::new(AuthCode::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuthCode::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // 5. Issued token pairs
        manager
            .create_table(
                Table::create()
                    .table(Token::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Token::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Token::Kid).string().not_null())
                    .col(
                        ColumnDef::new(Token::AccessToken)
                            .text()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Token::RefreshToken)
                            .string()
                            .null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Token::TokenType)
                            .string()
                            .not_null()
                            .default("Bearer"),
                    )
                    .col(ColumnDef::new(Token::ClientId).string().not_null())
                    .col(ColumnDef::new(Token::UserId).string().not_null())
                    .col(ColumnDef::new(Token::AuthorizationId).string().null())
                    .col(ColumnDef::new(Token::Scope).text().not_null())
                    .col(ColumnDef::new(Token::Audience).string().null())
                    .col(
                        ColumnDef::new(Token::Status)
                            .string()
                            .not_null()
                            .default("valid"),
                    )
                    .col(
                        ColumnDef::new(Token::AccessTokenExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Token::RefreshTokenExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Token::RefreshAbsoluteExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Token::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Token::RedeemedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Token::RevokedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Indexes for the hot lookup paths
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_authorization_user_client")
                    .table(Authorization::Table)
                    .col(Authorization::UserId)
                    .col(Authorization::ClientId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_auth_code_expires_at")
                    .table(AuthCode::Table)
                    .col(AuthCode::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_token_user_id")
                    .table(Token::Table)
                    .col(Token::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_token_client_id")
                    .table(Token::Table)
                    .col(Token::ClientId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_token_expires_at")
                    .table(Token::Table)
                    .col(Token::AccessTokenExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_token_expires_at").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_token_client_id").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_token_user_id").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_auth_code_expires_at").to_owned())
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_authorization_user_client")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Token::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AuthCode::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Authorization::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(User::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Client::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Client {
    Table,
    Id,
    Secret,
    Name,
    RedirectUris,
    GrantTypes,
    Scopes,
    IsPublic,
    RequirePkce,
    Enabled,
    PasswordGrantEnabled,
    PasswordScopes,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum User {
    Table,
    Id,
    Email,
    EmailVerified,
    Name,
    PasswordHash,
    Active,
    Anonymized,
    CreatedAt,
    LastLoginAt,
}

#[derive(DeriveIden)]
enum Authorization {
    Table,
    Id,
    UserId,
    ClientId,
    Kind,
    Scope,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AuthCode {
    Table,
    Code,
    ClientId,
    UserId,
    AuthorizationId,
    RedirectUri,
    Scope,
    Nonce,
    CodeChallenge,
    CodeChallengeMethod,
    Status,
    ExpiresAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Token {
    Table,
    Id,
    Kid,
    AccessToken,
    RefreshToken,
    TokenType,
    ClientId,
    UserId,
    AuthorizationId,
    Scope,
    Audience,
    Status,
    AccessTokenExpiresAt,
    RefreshTokenExpiresAt,
    RefreshAbsoluteExpiresAt,
    CreatedAt,
    RedeemedAt,
    RevokedAt,
}
