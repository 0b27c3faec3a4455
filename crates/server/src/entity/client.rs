//! OAuth2 client entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Grant type identifiers a client may be allowed to use.
pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const GRANT_CLIENT_CREDENTIALS: &str = "client_credentials";
pub const GRANT_PASSWORD: &str = "password";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "client")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// Client secret (None for public clients)
    pub secret: Option<String>,
    /// Human-readable client name
    pub name: String,
    /// JSON array of allowed redirect URIs (exact-match set)
    pub redirect_uris: String,
    /// Space-separated list of allowed grant types
    pub grant_types: String,
    /// Space-separated list of allowed scopes
    pub scopes: String,
    /// Whether this is a public client (no secret required)
    pub is_public: bool,
    /// Whether authorization requests must carry a PKCE challenge
    pub require_pkce: bool,
    /// Soft-disable flag; disabled clients cannot obtain new credentials
    pub enabled: bool,
    /// Whether this confidential integration client may use the password grant
    pub password_grant_enabled: bool,
    /// Space-separated scope allow-list for the password grant
    pub password_scopes: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Parse redirect URIs from JSON string
    pub fn redirect_uris_list(&self) -> Vec<String> {
        serde_json::from_str(&self.redirect_uris).unwrap_or_default()
    }

    /// Parse grant types from space-separated string
    pub fn grant_types_list(&self) -> Vec<String> {
        self.grant_types
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    /// Parse scopes from space-separated string
    pub fn scopes_list(&self) -> Vec<String> {
        self.scopes.split_whitespace().map(String::from).collect()
    }

    /// Parse the password-grant scope allow-list, if any
    pub fn password_scopes_list(&self) -> Vec<String> {
        self.password_scopes
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(String::from)
            .collect()
    }

    /// Check if a redirect URI is registered for this client.
    /// Matching is bit-for-bit; no prefix or partial matching.
    pub fn is_redirect_uri_allowed(&self, uri: &str) -> bool {
        self.redirect_uris_list()
            .iter()
            .any(|allowed| allowed == uri)
    }

    /// Check if a grant type is allowed for this client
    pub fn is_grant_type_allowed(&self, grant_type: &str) -> bool {
        self.grant_types_list().iter().any(|g| g == grant_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_client() -> Model {
        let now = OffsetDateTime::now_utc();
        Model {
            id: "spa-1".into(),
            secret: None,
            name: "Sample SPA".into(),
            redirect_uris: r#"["https://app/cb"]"#.into(),
            grant_types: "authorization_code refresh_token".into(),
            scopes: "openid profile".into(),
            is_public: true,
            require_pkce: true,
            enabled: true,
            password_grant_enabled: false,
            password_scopes: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn redirect_match_is_exact() {
        let client = sample_client();
        assert!(client.is_redirect_uri_allowed("https://app/cb"));
        assert!(!client.is_redirect_uri_allowed("https://app/cb/"));
        assert!(!client.is_redirect_uri_allowed("https://app/cb?x=1"));
        assert!(!client.is_redirect_uri_allowed("https://app"));
    }

    #[test]
    fn grant_type_allow_list() {
        let client = sample_client();
        assert!(client.is_grant_type_allowed(GRANT_AUTHORIZATION_CODE));
        assert!(client.is_grant_type_allowed(GRANT_REFRESH_TOKEN));
        assert!(!client.is_grant_type_allowed(GRANT_PASSWORD));
    }

    #[test]
    fn password_scopes_default_empty() {
        let client = sample_client();
        assert!(client.password_scopes_list().is_empty());
    }
}
