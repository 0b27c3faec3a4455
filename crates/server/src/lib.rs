//! An OAuth2/OpenID-Connect authorization server.
//!
//! This library implements the authorization and token-issuance engine:
//! the authorize/consent/token state machine, per-client policy
//! enforcement, token lifetime policy with refresh rotation and reuse
//! detection, the signing-key lifecycle with JWKS publication, and
//! credential revocation cascades.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::config::AppConfig;

pub mod api;
pub mod config;
pub mod entity;
pub mod error;
pub mod oauth2;

#[derive(Clone)]
pub struct AppResources {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
}
