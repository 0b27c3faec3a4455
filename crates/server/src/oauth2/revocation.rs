//! Credential revocation cascades.
//!
//! Three entry points: by user, by client, or by (user, client) pair.
//! Each flips every valid token and consent grant in scope to revoked and
//! reports counts. Disabling a client stops new issuance only; these
//! cascades are how already-issued credentials die.

use crate::entity::{authorization, token};
use crate::error::ServiceError;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;
use time::OffsetDateTime;

/// How many rows a cascade touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RevocationOutcome {
    pub tokens: u64,
    pub authorizations: u64,
}

#[derive(Clone)]
pub struct RevocationService {
    db: Arc<DatabaseConnection>,
}

impl RevocationService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Revoke every credential the subject holds, across all clients.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_user(&self, user_id: &str) -> Result<RevocationOutcome, ServiceError> {
        let outcome = self
            .cascade(Some(user_id), None)
            .await?;
        tracing::info!(
            user_id,
            tokens = outcome.tokens,
            authorizations = outcome.authorizations,
            "revoked all credentials for user"
        );
        Ok(outcome)
    }

    /// Revoke every credential issued to a client, across all subjects.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_client(&self, client_id: &str) -> Result<RevocationOutcome, ServiceError> {
        let outcome = self
            .cascade(None, Some(client_id))
            .await?;
        tracing::info!(
            client_id,
            tokens = outcome.tokens,
            authorizations = outcome.authorizations,
            "revoked all credentials for client"
        );
        Ok(outcome)
    }

    /// Revoke the credentials of one (subject, client) pair.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_user_client(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<RevocationOutcome, ServiceError> {
        let outcome = self
            .cascade(Some(user_id), Some(client_id))
            .await?;
        tracing::info!(
            user_id,
            client_id,
            tokens = outcome.tokens,
            authorizations = outcome.authorizations,
            "revoked credentials for user/client pair"
        );
        Ok(outcome)
    }

    async fn cascade(
        &self,
        user_id: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<RevocationOutcome, ServiceError> {
        let now = OffsetDateTime::now_utc();

        let mut tokens = token::Entity::update_many()
            .col_expr(token::Column::Status, Expr::value(token::STATUS_REVOKED))
            .col_expr(token::Column::RevokedAt, Expr::value(Some(now)))
            .filter(token::Column::Status.ne(token::STATUS_REVOKED));
        if let Some(user_id) = user_id {
            tokens = tokens.filter(token::Column::UserId.eq(user_id));
        }
        if let Some(client_id) = client_id {
            tokens = tokens.filter(token::Column::ClientId.eq(client_id));
        }
        let token_result = tokens.exec(self.db.as_ref()).await?;

        let mut grants = authorization::Entity::update_many()
            .col_expr(
                authorization::Column::Status,
                Expr::value(authorization::STATUS_REVOKED),
            )
            .col_expr(authorization::Column::UpdatedAt, Expr::value(now))
            .filter(authorization::Column::Status.eq(authorization::STATUS_VALID));
        if let Some(user_id) = user_id {
            grants = grants.filter(authorization::Column::UserId.eq(user_id));
        }
        if let Some(client_id) = client_id {
            grants = grants.filter(authorization::Column::ClientId.eq(client_id));
        }
        let grant_result = grants.exec(self.db.as_ref()).await?;

        Ok(RevocationOutcome {
            tokens: token_result.rows_affected,
            authorizations: grant_result.rows_affected,
        })
    }
}
