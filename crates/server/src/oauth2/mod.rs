//! OAuth2/OIDC authorization server core.
//!
//! This module owns the protocol state machine and the policy around it:
//!
//! - Authorization Code flow with PKCE, consent resolution and sessions
//! - Token endpoint grant dispatch (code, refresh, client credentials,
//!   password)
//! - Token lifetime policy with refresh rotation and an absolute chain
//!   ceiling
//! - Refresh reuse detection and revocation cascades
//! - Signing key lifecycle and JWKS publication
//!
//! ## Endpoints
//!
//! - `GET/POST /connect/authorize` - Authorization endpoint
//! - `POST /connect/token` - Token endpoint
//! - `GET /connect/userinfo` - OpenID Connect UserInfo
//! - `GET /connect/logout` - RP-initiated logout
//! - `GET /.well-known/jwks.json` - JWKS
//! - `GET /.well-known/openid-configuration` - Discovery

pub mod consent;
pub mod endpoints;
pub mod incident;
pub mod jwt;
pub mod keyring;
pub mod login;
pub mod maintenance;
pub mod policy;
pub mod reuse;
pub mod revocation;
pub mod session;
mod state;
pub mod token_policy;
pub mod users;

pub use endpoints::{OAUTH2_TAG, router};
pub use state::{OAuth2State, RequestContext};
pub use users::{hash_password, verify_password};
