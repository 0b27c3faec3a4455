use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Signing-key rotation settings. The bounds checked in `load_config` are
/// server-side guardrails; the admin UI cannot be trusted to enforce them.
#[derive(Clone, Debug, Deserialize)]
pub struct KeyRotationConfig {
    /// How long a key stays active before scheduled rotation
    #[serde(default = "default_rotation_interval_secs")]
    pub interval_secs: i64,
    /// How long a superseded key keeps verifying
    #[serde(default = "default_rotation_grace_secs")]
    pub grace_secs: i64,
    /// How stale the in-process key/JWKS cache may get
    #[serde(default = "default_jwks_cache_margin_secs")]
    pub jwks_cache_margin_secs: i64,
    /// How often the background scheduler checks whether rotation is due
    #[serde(default = "default_rotation_check_secs")]
    pub check_secs: u64,
}

impl Default for KeyRotationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_rotation_interval_secs(),
            grace_secs: default_rotation_grace_secs(),
            jwks_cache_margin_secs: default_jwks_cache_margin_secs(),
            check_secs: default_rotation_check_secs(),
        }
    }
}

/// Seed values for the token policy row on first boot. Later changes go
/// through the admin policy API, not this file.
#[derive(Clone, Debug, Deserialize)]
pub struct TokenTtlDefaults {
    #[serde(default = "default_access_ttl_secs")]
    pub access_ttl_secs: i64,
    #[serde(default = "default_refresh_ttl_secs")]
    pub refresh_ttl_secs: i64,
    #[serde(default = "default_id_token_ttl_secs")]
    pub id_token_ttl_secs: i64,
}

impl Default for TokenTtlDefaults {
    fn default() -> Self {
        Self {
            access_ttl_secs: default_access_ttl_secs(),
            refresh_ttl_secs: default_refresh_ttl_secs(),
            id_token_ttl_secs: default_id_token_ttl_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// Issuer URL stamped into tokens. Must be absolute, and HTTPS unless
    /// `development_mode` is set.
    pub issuer_url: String,
    #[serde(default)]
    pub development_mode: bool,
    /// HMAC secret for session cookies and consent tokens (>= 32 bytes)
    pub session_secret: String,
    /// Bearer token guarding the admin API
    pub admin_token: String,
    /// Server-wide scope allow-list; requested scopes outside it are
    /// silently dropped
    #[serde(default = "default_allowed_scopes")]
    pub allowed_scopes: Vec<String>,
    /// Audience stamped into access tokens, if any
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
    /// Resource-owner password grant is off unless explicitly enabled
    #[serde(default)]
    pub password_grant_enabled: bool,
    #[serde(default = "default_auth_code_ttl_secs")]
    pub auth_code_ttl_secs: i64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,
    #[serde(default)]
    pub rotation: KeyRotationConfig,
    #[serde(default)]
    pub token_ttl_defaults: TokenTtlDefaults,
    /// How often the retention sweep runs
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// How long spent codes and dead tokens are kept for audit
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_db_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_timeout_secs")]
    pub db_acquire_timeout_secs: u64,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_allowed_scopes() -> Vec<String> {
    ["openid", "profile", "email"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_clock_skew_secs() -> u64 {
    60
}

fn default_auth_code_ttl_secs() -> i64 {
    600
}

fn default_session_ttl_secs() -> i64 {
    8 * 3600
}

fn default_rotation_interval_secs() -> i64 {
    30 * 86400
}

fn default_rotation_grace_secs() -> i64 {
    86400
}

fn default_jwks_cache_margin_secs() -> i64 {
    300
}

fn default_rotation_check_secs() -> u64 {
    60
}

fn default_access_ttl_secs() -> i64 {
    900
}

fn default_refresh_ttl_secs() -> i64 {
    7 * 86400
}

fn default_id_token_ttl_secs() -> i64 {
    900
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_retention_days() -> i64 {
    30
}

fn default_db_timeout_secs() -> u64 {
    8
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Load application configuration from `config.yaml` + environment
/// overrides (double-underscore separator, e.g. `ROTATION__GRACE_SECS`).
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml"))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    validate(&app)?;
    Ok(app)
}

fn validate(app: &AppConfig) -> Result<(), ConfigError> {
    let issuer = Url::parse(&app.issuer_url)
        .map_err(|e| ConfigError::Validation(format!("issuer_url is not absolute: {e}")))?;
    if issuer.scheme() != "https" && !app.development_mode {
        return Err(ConfigError::Validation(
            "issuer_url must be HTTPS outside development_mode".into(),
        ));
    }
    if app.session_secret.len() < 32 {
        return Err(ConfigError::Validation(
            "session_secret must be at least 32 characters".into(),
        ));
    }
    if app.admin_token.is_empty() {
        return Err(ConfigError::Validation("admin_token must be set".into()));
    }
    if app.rotation.interval_secs < 3600 {
        return Err(ConfigError::Validation(
            "rotation.interval_secs must be at least one hour".into(),
        ));
    }
    if app.rotation.grace_secs < 60 || app.rotation.grace_secs > app.rotation.interval_secs {
        return Err(ConfigError::Validation(
            "rotation.grace_secs must be between 60 and the rotation interval".into(),
        ));
    }
    if app.rotation.jwks_cache_margin_secs < 1
        || app.rotation.jwks_cache_margin_secs > app.rotation.grace_secs
    {
        return Err(ConfigError::Validation(
            "rotation.jwks_cache_margin_secs must be between 1 and the grace period".into(),
        ));
    }
    if app.clock_skew_secs > 300 {
        return Err(ConfigError::Validation(
            "clock_skew_secs must not exceed 300".into(),
        ));
    }
    if app.auth_code_ttl_secs < 30 || app.auth_code_ttl_secs > 3600 {
        return Err(ConfigError::Validation(
            "auth_code_ttl_secs must be between 30 and 3600".into(),
        ));
    }
    Ok(())
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".into(),
            issuer_url: "https://id.example.org".into(),
            development_mode: false,
            session_secret: "0123456789abcdef0123456789abcdef".into(),
            admin_token: "admin-secret".into(),
            allowed_scopes: default_allowed_scopes(),
            audience: None,
            clock_skew_secs: 60,
            password_grant_enabled: false,
            auth_code_ttl_secs: 600,
            session_ttl_secs: 8 * 3600,
            rotation: KeyRotationConfig::default(),
            token_ttl_defaults: TokenTtlDefaults::default(),
            cleanup_interval_secs: 3600,
            retention_days: 30,
            db_connect_timeout_secs: 8,
            db_acquire_timeout_secs: 8,
            listen_addr: "127.0.0.1:0".into(),
        }
    }

    #[test]
    fn https_issuer_required_outside_development() {
        let mut cfg = base_config();
        cfg.issuer_url = "http://id.example.org".into();
        assert!(validate(&cfg).is_err());
        cfg.development_mode = true;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn issuer_must_be_absolute() {
        let mut cfg = base_config();
        cfg.issuer_url = "/connect".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn short_session_secret_rejected() {
        let mut cfg = base_config();
        cfg.session_secret = "too-short".into();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rotation_guardrails_enforced() {
        let mut cfg = base_config();
        cfg.rotation.interval_secs = 600;
        assert!(validate(&cfg).is_err());

        let mut cfg = base_config();
        cfg.rotation.grace_secs = cfg.rotation.interval_secs + 1;
        assert!(validate(&cfg).is_err());

        let mut cfg = base_config();
        cfg.rotation.jwks_cache_margin_secs = cfg.rotation.grace_secs + 1;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(validate(&base_config()).is_ok());
    }
}
