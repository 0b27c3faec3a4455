//! Authorization (consent grant) entity.
//!
//! A row records a subject's grant of scopes to a client. Permanent grants
//! survive across sessions and are consumed by silent authorization; ad-hoc
//! grants back a single flow. At most one valid permanent grant may exist
//! per (user, client) pair, and its scope set only ever grows on re-consent.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const KIND_PERMANENT: &str = "permanent";
pub const KIND_AD_HOC: &str = "ad_hoc";

pub const STATUS_VALID: &str = "valid";
pub const STATUS_REVOKED: &str = "revoked";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "authorization")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user_id: String,
    pub client_id: String,
    /// "permanent" or "ad_hoc"
    pub kind: String,
    /// Space-separated granted scope set
    pub scope: String,
    /// "valid" or "revoked"
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_valid(&self) -> bool {
        self.status == STATUS_VALID
    }

    pub fn scopes_list(&self) -> Vec<String> {
        self.scope.split_whitespace().map(String::from).collect()
    }

    /// Check whether every requested scope is already covered by this grant.
    pub fn covers_scopes(&self, requested: &[String]) -> bool {
        let granted = self.scopes_list();
        requested.iter().all(|s| granted.contains(s))
    }

    /// Union of the currently granted scopes and `additional`, preserving
    /// the order of the existing grant. Re-consent expands, never replaces.
    pub fn merged_scope(&self, additional: &[String]) -> String {
        let mut merged = self.scopes_list();
        for scope in additional {
            if !merged.contains(scope) {
                merged.push(scope.clone());
            }
        }
        merged.join(" ")
    }
}
