//! Token policy snapshot entity.
//!
//! A single row (id = 1) holds the process-wide issuance policy. Admin
//! updates go through an optimistic row_version check so concurrent edits
//! surface as conflicts instead of lost updates.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Primary key of the singleton policy row.
pub const SINGLETON_ID: i32 = 1;

pub const REUSE_ACTION_SUBJECT: &str = "subject";
pub const REUSE_ACTION_CLIENT_SUBJECT: &str = "client_subject";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "token_policy")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub id_token_ttl_secs: i64,
    pub refresh_rotation_enabled: bool,
    pub reuse_detection_enabled: bool,
    /// "subject" or "client_subject" - blast radius of reuse remediation
    pub reuse_action: String,
    /// Window in which losing a redemption race is a benign client retry
    pub reuse_leeway_secs: i64,
    pub row_version: i32,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
