//! SeaORM entities for the authorization server.

pub mod auth_code;
pub mod authorization;
pub mod client;
pub mod signing_key;
pub mod token;
pub mod token_policy;
pub mod user;
