//! Token lifetime policy.
//!
//! The engine itself is a pure function over a policy snapshot: given the
//! issuance instant and an optional absolute ceiling inherited from the
//! chain's first refresh token, it stamps expiries onto the new pair. The
//! snapshot lives in a singleton row updated only through the admin API
//! with optimistic concurrency.

use crate::config::TokenTtlDefaults;
use crate::entity::token_policy;
use crate::error::ServiceError;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// Blast radius of refresh-reuse remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseAction {
    /// Revoke everything the subject holds
    Subject,
    /// Revoke only the (subject, client) pair
    ClientSubject,
}

impl ReuseAction {
    pub fn from_str(s: &str) -> Self {
        match s {
            token_policy::REUSE_ACTION_SUBJECT => ReuseAction::Subject,
            _ => ReuseAction::ClientSubject,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReuseAction::Subject => token_policy::REUSE_ACTION_SUBJECT,
            ReuseAction::ClientSubject => token_policy::REUSE_ACTION_CLIENT_SUBJECT,
        }
    }
}

/// In-memory view of the policy row, read on every issuance.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub id_token_ttl: Duration,
    pub refresh_rotation_enabled: bool,
    pub reuse_detection_enabled: bool,
    pub reuse_action: ReuseAction,
    pub reuse_leeway: Duration,
    pub row_version: i32,
}

impl From<token_policy::Model> for PolicySnapshot {
    fn from(model: token_policy::Model) -> Self {
        PolicySnapshot {
            access_ttl: Duration::seconds(model.access_ttl_secs),
            refresh_ttl: Duration::seconds(model.refresh_ttl_secs),
            id_token_ttl: Duration::seconds(model.id_token_ttl_secs),
            refresh_rotation_enabled: model.refresh_rotation_enabled,
            reuse_detection_enabled: model.reuse_detection_enabled,
            reuse_action: ReuseAction::from_str(&model.reuse_action),
            reuse_leeway: Duration::seconds(model.reuse_leeway_secs),
            row_version: model.row_version,
        }
    }
}

/// Lifetimes stamped onto a newly issued principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedLifetimes {
    pub access_expires_at: OffsetDateTime,
    pub refresh_expires_at: Option<OffsetDateTime>,
    /// Ceiling the whole refresh chain may never outlive
    pub refresh_absolute_expires_at: Option<OffsetDateTime>,
    pub id_token_expires_at: OffsetDateTime,
}

/// Stamp expiries for a token pair issued at `now`.
///
/// `refresh_absolute_ceiling` carries the original chain ceiling across
/// rotations: a rotated refresh token slides forward by `refresh_ttl` but
/// is clamped so continual rotation cannot revive a compromised chain
/// indefinitely. Pass `None` when starting a fresh chain.
pub fn apply(
    policy: &PolicySnapshot,
    now: OffsetDateTime,
    refresh_absolute_ceiling: Option<OffsetDateTime>,
    include_refresh: bool,
) -> StampedLifetimes {
    let access_expires_at = now + policy.access_ttl;
    let id_token_expires_at = now + policy.id_token_ttl;

    let (refresh_expires_at, refresh_absolute_expires_at) = if include_refresh {
        let ceiling = refresh_absolute_ceiling.unwrap_or(now + policy.refresh_ttl);
        let sliding = now + policy.refresh_ttl;
        let expires = if sliding < ceiling { sliding } else { ceiling };
        (Some(expires), Some(ceiling))
    } else {
        (None, None)
    };

    StampedLifetimes {
        access_expires_at,
        refresh_expires_at,
        refresh_absolute_expires_at,
        id_token_expires_at,
    }
}

/// Read/write access to the singleton policy row.
#[derive(Clone)]
pub struct PolicyStore {
    db: Arc<DatabaseConnection>,
}

impl PolicyStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Current policy snapshot. Issuance fails closed if the row is gone.
    #[tracing::instrument(skip(self))]
    pub async fn current(&self) -> Result<PolicySnapshot, ServiceError> {
        let model = token_policy::Entity::find_by_id(token_policy::SINGLETON_ID)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| {
                ServiceError::Db(sea_orm::DbErr::RecordNotFound(
                    "token policy row missing".to_string(),
                ))
            })?;
        Ok(model.into())
    }

    /// Insert the policy row with configured seed values if it is missing.
    /// Later changes go through the admin update path, never this. Seed
    /// races between instances are benign: the loser hits the primary key
    /// and reloads.
    #[tracing::instrument(skip(self, defaults))]
    pub async fn ensure_seeded(&self, defaults: &TokenTtlDefaults) -> Result<(), ServiceError> {
        if token_policy::Entity::find_by_id(token_policy::SINGLETON_ID)
            .one(self.db.as_ref())
            .await?
            .is_some()
        {
            return Ok(());
        }

        let row = token_policy::ActiveModel {
            id: Set(token_policy::SINGLETON_ID),
            access_ttl_secs: Set(defaults.access_ttl_secs),
            refresh_ttl_secs: Set(defaults.refresh_ttl_secs),
            id_token_ttl_secs: Set(defaults.id_token_ttl_secs),
            refresh_rotation_enabled: Set(true),
            reuse_detection_enabled: Set(true),
            reuse_action: Set(token_policy::REUSE_ACTION_CLIENT_SUBJECT.to_string()),
            reuse_leeway_secs: Set(30),
            row_version: Set(1),
            updated_at: Set(OffsetDateTime::now_utc()),
        };
        match row.insert(self.db.as_ref()).await {
            Ok(_) => {
                tracing::info!("seeded token policy row");
                Ok(())
            }
            Err(e) => {
                let seeded = token_policy::Entity::find_by_id(token_policy::SINGLETON_ID)
                    .one(self.db.as_ref())
                    .await?
                    .is_some();
                if seeded { Ok(()) } else { Err(e.into()) }
            }
        }
    }

    /// Replace the policy row iff `expected_version` still matches.
    /// A losing writer gets `ServiceError::Conflict` and must reload.
    #[tracing::instrument(skip(self, update))]
    pub async fn update(
        &self,
        update: PolicyUpdate,
        expected_version: i32,
    ) -> Result<PolicySnapshot, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let result = token_policy::Entity::update_many()
            .col_expr(
                token_policy::Column::AccessTtlSecs,
                Expr::value(update.access_ttl_secs),
            )
            .col_expr(
                token_policy::Column::RefreshTtlSecs,
                Expr::value(update.refresh_ttl_secs),
            )
            .col_expr(
                token_policy::Column::IdTokenTtlSecs,
                Expr::value(update.id_token_ttl_secs),
            )
            .col_expr(
                token_policy::Column::RefreshRotationEnabled,
                Expr::value(update.refresh_rotation_enabled),
            )
            .col_expr(
                token_policy::Column::ReuseDetectionEnabled,
                Expr::value(update.reuse_detection_enabled),
            )
            .col_expr(
                token_policy::Column::ReuseAction,
                Expr::value(update.reuse_action.as_str()),
            )
            .col_expr(
                token_policy::Column::ReuseLeewaySecs,
                Expr::value(update.reuse_leeway_secs),
            )
            .col_expr(
                token_policy::Column::RowVersion,
                Expr::value(expected_version + 1),
            )
            .col_expr(token_policy::Column::UpdatedAt, Expr::value(now))
            .filter(token_policy::Column::Id.eq(token_policy::SINGLETON_ID))
            .filter(token_policy::Column::RowVersion.eq(expected_version))
            .exec(self.db.as_ref())
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict);
        }

        tracing::info!(
            row_version = expected_version + 1,
            rotation = update.refresh_rotation_enabled,
            reuse_detection = update.reuse_detection_enabled,
            "token policy updated"
        );
        self.current().await
    }
}

/// Admin-supplied replacement values for the policy row.
#[derive(Debug, Clone)]
pub struct PolicyUpdate {
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub id_token_ttl_secs: i64,
    pub refresh_rotation_enabled: bool,
    pub reuse_detection_enabled: bool,
    pub reuse_action: ReuseAction,
    pub reuse_leeway_secs: i64,
}
