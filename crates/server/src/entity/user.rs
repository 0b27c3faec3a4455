//! User entity - the subject store behind the authentication oracle.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user")]
pub struct Model {
    /// Stable subject identifier
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub email: String,
    pub email_verified: bool,
    pub name: Option<String>,
    /// Argon2 PHC hash; None for subjects without password credentials
    pub password_hash: Option<String>,
    /// Deactivated subjects cannot authenticate or use tokens
    pub active: bool,
    /// Anonymized subjects keep their id but expose no claims
    pub anonymized: bool,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether this subject may authenticate and hold live tokens.
    pub fn is_usable(&self) -> bool {
        self.active && !self.anonymized
    }
}
