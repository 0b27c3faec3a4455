//! Refresh token redemption and reuse remediation.
//!
//! Redemption is serialized per token id by a conditional state transition
//! at the storage layer: the row flips from valid to redeemed only for one
//! caller, however many instances race. A loser inside the leeway window
//! is a retrying client and gets a plain `invalid_grant`; a loser outside
//! it is replay of a consumed token, which triggers the revocation cascade
//! configured by the policy's reuse action.

use crate::entity::{client, token};
use crate::error::{ProtocolError, ServiceError};
use crate::oauth2::incident::{IncidentSink, Severity};
use crate::oauth2::revocation::RevocationService;
use crate::oauth2::token_policy::{PolicySnapshot, ReuseAction};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use time::OffsetDateTime;

/// Result of presenting a refresh token for redemption.
#[derive(Debug)]
pub enum RefreshRedemption {
    /// Rotation enabled: the presented token is now consumed and the caller
    /// mints a replacement pair from the prior record.
    Rotated { prior: token::Model },
    /// Rotation disabled: the token stays valid (sliding window) and the
    /// caller mints a new access token against it.
    Reusable { current: token::Model },
}

/// Hash a refresh token the way it is stored. Cleartext never hits the
/// database.
pub fn hash_refresh_token(cleartext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cleartext.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[derive(Clone)]
pub struct RefreshGuard {
    db: Arc<DatabaseConnection>,
    incidents: IncidentSink,
    revocation: RevocationService,
}

impl RefreshGuard {
    pub fn new(
        db: Arc<DatabaseConnection>,
        incidents: IncidentSink,
        revocation: RevocationService,
    ) -> Self {
        Self {
            db,
            incidents,
            revocation,
        }
    }

    /// Redeem `cleartext` for the given client under the current policy.
    #[tracing::instrument(skip(self, policy, cleartext))]
    pub async fn redeem(
        &self,
        policy: &PolicySnapshot,
        client: &client::Model,
        cleartext: &str,
    ) -> Result<RefreshRedemption, ProtocolError> {
        let now = OffsetDateTime::now_utc();
        let hash = hash_refresh_token(cleartext);

        let record = token::Entity::find()
            .filter(token::Column::RefreshToken.eq(&hash))
            .one(self.db.as_ref())
            .await
            .map_err(ServiceError::from)?;

        let record = match record {
            Some(r) => r,
            None => {
                return Err(ProtocolError::InvalidGrant(
                    "refresh token is not valid".to_string(),
                ));
            }
        };

        // A token presented by a client it was never issued to is a
        // cross-client leak signal, not a mere bad request.
        if record.client_id != client.id {
            self.incidents.log_incident(
                "refresh_token_wrong_client",
                Severity::High,
                Some(&record.user_id),
                Some(&client.id),
                "refresh token presented by a different client",
            );
            return Err(ProtocolError::InvalidGrant(
                "refresh token is not valid".to_string(),
            ));
        }

        if record.is_revoked() {
            return Err(ProtocolError::InvalidGrant(
                "refresh token has been revoked".to_string(),
            ));
        }
        if record.is_refresh_token_expired() {
            return Err(ProtocolError::InvalidGrant(
                "refresh token has expired".to_string(),
            ));
        }

        if !policy.refresh_rotation_enabled {
            // Non-rotating refresh tokens are reusable by design; reuse
            // detection is meaningless here.
            return Ok(RefreshRedemption::Reusable { current: record });
        }

        let won = token::Entity::update_many()
            .col_expr(token::Column::Status, Expr::value(token::STATUS_REDEEMED))
            .col_expr(token::Column::RedeemedAt, Expr::value(Some(now)))
            .filter(token::Column::Id.eq(&record.id))
            .filter(token::Column::Status.eq(token::STATUS_VALID))
            .exec(self.db.as_ref())
            .await
            .map_err(ServiceError::from)?;

        if won.rows_affected == 1 {
            return Ok(RefreshRedemption::Rotated { prior: record });
        }

        // Lost the transition: someone redeemed or revoked this id first.
        let current = token::Entity::find_by_id(&record.id)
            .one(self.db.as_ref())
            .await
            .map_err(ServiceError::from)?;

        if let Some(current) = current
            && current.status == token::STATUS_REDEEMED
        {
            let redeemed_at = current.redeemed_at.unwrap_or(now);
            let within_leeway = now - redeemed_at <= policy.reuse_leeway;

            if !within_leeway && policy.reuse_detection_enabled {
                self.remediate(policy, &current).await;
            } else if within_leeway {
                tracing::debug!(
                    token_id = %current.id,
                    "refresh redemption race inside leeway window, treating as client retry"
                );
            }
        }

        Err(ProtocolError::InvalidGrant(
            "refresh token has already been used".to_string(),
        ))
    }

    /// Reuse confirmed: log the incident and cascade revocation over the
    /// configured blast radius. Remediation failures are logged but do not
    /// change the caller's `invalid_grant` outcome.
    async fn remediate(&self, policy: &PolicySnapshot, reused: &token::Model) {
        self.incidents.log_incident(
            "refresh_token_reuse",
            Severity::High,
            Some(&reused.user_id),
            Some(&reused.client_id),
            "replay of a consumed refresh token",
        );

        let result = match policy.reuse_action {
            ReuseAction::Subject => self.revocation.revoke_user(&reused.user_id).await,
            ReuseAction::ClientSubject => {
                self.revocation
                    .revoke_user_client(&reused.user_id, &reused.client_id)
                    .await
            }
        };

        match result {
            Ok(outcome) => tracing::warn!(
                user_id = %reused.user_id,
                client_id = %reused.client_id,
                action = policy.reuse_action.as_str(),
                tokens = outcome.tokens,
                authorizations = outcome.authorizations,
                "reuse remediation cascade completed"
            ),
            Err(e) => tracing::error!(
                user_id = %reused.user_id,
                client_id = %reused.client_id,
                error = %e,
                "reuse remediation cascade failed"
            ),
        }
    }

    /// Slide a reusable refresh token's expiry forward, clamped to its
    /// absolute ceiling.
    pub async fn slide_expiry(
        &self,
        record: &token::Model,
        new_expiry: OffsetDateTime,
    ) -> Result<(), ServiceError> {
        let clamped = match record.refresh_absolute_expires_at {
            Some(ceiling) if ceiling < new_expiry => ceiling,
            _ => new_expiry,
        };
        token::Entity::update_many()
            .col_expr(
                token::Column::RefreshTokenExpiresAt,
                Expr::value(Some(clamped)),
            )
            .filter(token::Column::Id.eq(&record.id))
            .filter(token::Column::Status.eq(token::STATUS_VALID))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }
}
