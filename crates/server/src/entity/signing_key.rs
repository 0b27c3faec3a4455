//! Signing key entity.
//!
//! Lifecycle: upcoming -> active -> previous -> retired, with revoked
//! reachable from any state on incident. Exactly one key is active at a
//! time; previous keys verify signatures until `retire_after`.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const STATUS_UPCOMING: &str = "upcoming";
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_PREVIOUS: &str = "previous";
pub const STATUS_RETIRED: &str = "retired";
pub const STATUS_REVOKED: &str = "revoked";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "signing_key")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub kid: String,
    pub alg: String,
    /// PKCS#8 DER private key, base64 (never exported)
    pub private_pkcs8: String,
    /// Public key x coordinate, base64url (JWKS form)
    pub public_x: String,
    /// Public key y coordinate, base64url (JWKS form)
    pub public_y: String,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub activated_at: Option<OffsetDateTime>,
    /// When a previous key stops verifying
    pub retire_after: Option<OffsetDateTime>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub row_version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether this key may still verify signatures at `now`.
    /// Active keys always verify; previous keys verify until their grace
    /// window closes; retired and revoked keys never verify.
    pub fn verifies_at(&self, now: OffsetDateTime) -> bool {
        match self.status.as_str() {
            STATUS_ACTIVE => true,
            STATUS_PREVIOUS => self.retire_after.map(|t| now < t).unwrap_or(false),
            _ => false,
        }
    }

    /// Whether this key belongs in the published JWKS at `now`.
    pub fn published_at(&self, now: OffsetDateTime) -> bool {
        self.verifies_at(now)
    }
}
