//! Retention maintenance.
//!
//! Periodic sweeps delete spent authorization codes and long-dead tokens.
//! Both operations are idempotent and safe to run concurrently from
//! several instances; deleting an already-deleted row is a no-op.

use crate::error::ServiceError;
use crate::entity::{auth_code, token};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use time::{Duration, OffsetDateTime};

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub auth_codes: u64,
    pub tokens: u64,
}

/// Delete authorization codes past their expiry and tokens whose access
/// and refresh lifetimes both ended more than `retention` ago. Recently
/// dead rows are kept for audit.
#[tracing::instrument(skip(db))]
pub async fn purge_expired(
    db: &DatabaseConnection,
    retention: Duration,
) -> Result<SweepOutcome, ServiceError> {
    let now = OffsetDateTime::now_utc();
    let horizon = now - retention;

    let codes = auth_code::Entity::delete_many()
        .filter(auth_code::Column::ExpiresAt.lt(horizon))
        .exec(db)
        .await?;

    let tokens = token::Entity::delete_many()
        .filter(token::Column::AccessTokenExpiresAt.lt(horizon))
        .filter(
            token::Column::RefreshTokenExpiresAt
                .lt(horizon)
                .or(token::Column::RefreshTokenExpiresAt.is_null()),
        )
        .exec(db)
        .await?;

    if codes.rows_affected > 0 || tokens.rows_affected > 0 {
        tracing::info!(
            auth_codes = codes.rows_affected,
            tokens = tokens.rows_affected,
            "retention sweep removed expired rows"
        );
    }

    Ok(SweepOutcome {
        auth_codes: codes.rows_affected,
        tokens: tokens.rows_affected,
    })
}
