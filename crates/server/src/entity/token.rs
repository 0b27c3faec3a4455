//! Token entity - issued access/refresh token pairs.
//!
//! Refresh tokens are stored as SHA-256 hashes; the cleartext leaves the
//! server exactly once, in the token response. Redemption of a refresh
//! token is an atomic conditional transition of `status` from valid to
//! redeemed, serialized at the storage layer.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const STATUS_VALID: &str = "valid";
pub const STATUS_REDEEMED: &str = "redeemed";
pub const STATUS_REVOKED: &str = "revoked";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "token")]
pub struct Model {
    /// Token id, doubles as the JWT `jti` claim
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Signing key the access token was signed with
    pub kid: String,
    #[sea_orm(unique)]
    pub access_token: String,
    /// SHA-256 hash of the refresh token (base64url)
    #[sea_orm(unique)]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub client_id: String,
    pub user_id: String,
    /// Consent grant this pair was issued under
    pub authorization_id: Option<String>,
    pub scope: String,
    /// Space-separated audience (resource) identifiers
    pub audience: Option<String>,
    /// "valid", "redeemed" or "revoked"
    pub status: String,
    pub access_token_expires_at: OffsetDateTime,
    pub refresh_token_expires_at: Option<OffsetDateTime>,
    /// Absolute ceiling for the refresh chain, carried across rotations
    pub refresh_absolute_expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub redeemed_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_revoked(&self) -> bool {
        self.status == STATUS_REVOKED || self.revoked_at.is_some()
    }

    pub fn is_access_token_expired(&self) -> bool {
        self.access_token_expires_at < OffsetDateTime::now_utc()
    }

    pub fn is_refresh_token_expired(&self) -> bool {
        match self.refresh_token_expires_at {
            Some(expires_at) => expires_at < OffsetDateTime::now_utc(),
            None => true,
        }
    }

    /// Check if the access token is valid for use
    pub fn is_valid(&self) -> bool {
        self.status == STATUS_VALID && !self.is_access_token_expired()
    }

    pub fn scopes_list(&self) -> Vec<String> {
        self.scope.split_whitespace().map(String::from).collect()
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes_list().iter().any(|s| s == scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(status: &str, access_expires_in_secs: i64) -> Model {
        let now = OffsetDateTime::now_utc();
        Model {
            id: "jti-1".into(),
            kid: "key-1".into(),
            access_token: "at-1".into(),
            refresh_token: Some("rt-hash-1".into()),
            token_type: "Bearer".into(),
            client_id: "client-1".into(),
            user_id: "user-1".into(),
            authorization_id: None,
            scope: "openid profile".into(),
            audience: None,
            status: status.into(),
            access_token_expires_at: now + time::Duration::seconds(access_expires_in_secs),
            refresh_token_expires_at: Some(now + time::Duration::hours(1)),
            refresh_absolute_expires_at: Some(now + time::Duration::hours(2)),
            created_at: now,
            redeemed_at: None,
            revoked_at: None,
        }
    }

    #[test]
    fn valid_requires_valid_status_and_unexpired() {
        assert!(token(STATUS_VALID, 60).is_valid());
        assert!(!token(STATUS_VALID, -60).is_valid());
        assert!(!token(STATUS_REDEEMED, 60).is_valid());
        assert!(!token(STATUS_REVOKED, 60).is_valid());
    }

    #[test]
    fn scope_membership() {
        let t = token(STATUS_VALID, 60);
        assert!(t.has_scope("openid"));
        assert!(!t.has_scope("email"));
    }
}
