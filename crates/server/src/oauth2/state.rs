//! Shared state for the authorization server.

use crate::config::AppConfig;
use crate::entity::client;
use crate::oauth2::incident::IncidentSink;
use crate::oauth2::keyring::KeyRing;
use crate::oauth2::reuse::RefreshGuard;
use crate::oauth2::revocation::RevocationService;
use crate::oauth2::session::SessionKeys;
use crate::oauth2::token_policy::PolicyStore;
use crate::oauth2::users::UserDirectory;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use time::Duration;

/// Everything the protocol endpoints need, cheap to clone per request.
#[derive(Clone)]
pub struct OAuth2State {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub keyring: KeyRing,
    pub policies: PolicyStore,
    pub refresh: RefreshGuard,
    pub revocation: RevocationService,
    pub incidents: IncidentSink,
    pub users: UserDirectory,
    pub sessions: SessionKeys,
}

impl OAuth2State {
    pub fn new(db: Arc<DatabaseConnection>, config: Arc<AppConfig>) -> Self {
        let incidents = IncidentSink::new();
        let revocation = RevocationService::new(db.clone());
        let keyring = KeyRing::new(
            db.clone(),
            Duration::seconds(config.rotation.grace_secs),
            Duration::seconds(config.rotation.jwks_cache_margin_secs),
            config.issuer_url.clone(),
            config.clock_skew_secs,
        );
        Self {
            policies: PolicyStore::new(db.clone()),
            refresh: RefreshGuard::new(db.clone(), incidents.clone(), revocation.clone()),
            revocation,
            incidents,
            users: UserDirectory::new(db.clone()),
            sessions: SessionKeys::new(config.session_secret.as_bytes()),
            keyring,
            db,
            config,
        }
    }

    /// Generate a secure random opaque token (auth codes, refresh tokens).
    pub fn generate_token() -> String {
        use base64::Engine;
        let mut bytes = [0u8; 32];
        getrandom::fill(&mut bytes).expect("Failed to generate random bytes");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn issuer(&self) -> &str {
        &self.config.issuer_url
    }

    /// Intersect requested scopes with the server-wide allow-list and the
    /// client's own grant. Unknown or unauthorized scopes are dropped
    /// silently; an empty result falls back to the client's allowed scopes
    /// (themselves filtered by the server list).
    pub fn intersect_scopes(
        &self,
        client: &client::Model,
        requested: Option<&str>,
    ) -> Vec<String> {
        let server_allowed = &self.config.allowed_scopes;
        let client_allowed = client.scopes_list();

        let filtered: Vec<String> = requested
            .unwrap_or_default()
            .split_whitespace()
            .filter(|s| server_allowed.iter().any(|a| a == s))
            .filter(|s| client_allowed.iter().any(|a| a == s))
            .map(String::from)
            .collect();

        if !filtered.is_empty() {
            return filtered;
        }
        client_allowed
            .into_iter()
            .filter(|s| server_allowed.iter().any(|a| a == s))
            .collect()
    }
}

/// Explicit per-request context threaded into logging and incident
/// reporting instead of any ambient request-global state.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub client_id: Option<String>,
    pub subject: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            client_id: None,
            subject: None,
        }
    }

    pub fn with_client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
