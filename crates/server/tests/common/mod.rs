#![allow(dead_code)]
//! Shared test harness: an in-memory database carrying the full schema and
//! a `TestServer` wired the way the production router is.

use axum::http::{HeaderName, HeaderValue};
use axum_test::TestServer;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rust_oidc_provider::api::admin;
use rust_oidc_provider::config::{AppConfig, KeyRotationConfig, TokenTtlDefaults};
use rust_oidc_provider::entity::{client, token, token_policy, user};
use rust_oidc_provider::oauth2::{self, OAuth2State, hash_password};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbBackend, EntityTrait,
    IntoActiveModel, QueryFilter, Statement,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use time::OffsetDateTime;
use utoipa_axum::router::OpenApiRouter;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE client (
        id TEXT PRIMARY KEY,
        secret TEXT NULL,
        name TEXT NOT NULL,
        redirect_uris TEXT NOT NULL,
        grant_types TEXT NOT NULL DEFAULT 'authorization_code',
        scopes TEXT NOT NULL DEFAULT 'openid profile email',
        is_public INTEGER NOT NULL DEFAULT 0,
        require_pkce INTEGER NOT NULL DEFAULT 0,
        enabled INTEGER NOT NULL DEFAULT 1,
        password_grant_enabled INTEGER NOT NULL DEFAULT 0,
        password_scopes TEXT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE user (
        id TEXT PRIMARY KEY,
        email TEXT NOT NULL UNIQUE,
        email_verified INTEGER NOT NULL DEFAULT 0,
        name TEXT NULL,
        password_hash TEXT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        anonymized INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        last_login_at TEXT NULL
    );"#,
    r#"CREATE TABLE authorization (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        client_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        scope TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'valid',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE auth_code (
        code TEXT PRIMARY KEY,
        client_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        authorization_id TEXT NULL,
        redirect_uri TEXT NOT NULL,
        scope TEXT NOT NULL,
        nonce TEXT NULL,
        code_challenge TEXT NULL,
        code_challenge_method TEXT NULL,
        status TEXT NOT NULL DEFAULT 'valid',
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    );"#,
    r#"CREATE TABLE token (
        id TEXT PRIMARY KEY,
        kid TEXT NOT NULL,
        access_token TEXT NOT NULL UNIQUE,
        refresh_token TEXT NULL UNIQUE,
        token_type TEXT NOT NULL DEFAULT 'Bearer',
        client_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        authorization_id TEXT NULL,
        scope TEXT NOT NULL,
        audience TEXT NULL,
        status TEXT NOT NULL DEFAULT 'valid',
        access_token_expires_at TEXT NOT NULL,
        refresh_token_expires_at TEXT NULL,
        refresh_absolute_expires_at TEXT NULL,
        created_at TEXT NOT NULL,
        redeemed_at TEXT NULL,
        revoked_at TEXT NULL
    );"#,
    r#"CREATE TABLE signing_key (
        kid TEXT PRIMARY KEY,
        alg TEXT NOT NULL DEFAULT 'ES256',
        private_pkcs8 TEXT NOT NULL,
        public_x TEXT NOT NULL,
        public_y TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        activated_at TEXT NULL,
        retire_after TEXT NULL,
        not_before TEXT NOT NULL,
        not_after TEXT NOT NULL,
        row_version INTEGER NOT NULL DEFAULT 1
    );"#,
    r#"CREATE TABLE token_policy (
        id INTEGER PRIMARY KEY,
        access_ttl_secs INTEGER NOT NULL,
        refresh_ttl_secs INTEGER NOT NULL,
        id_token_ttl_secs INTEGER NOT NULL,
        refresh_rotation_enabled INTEGER NOT NULL DEFAULT 1,
        reuse_detection_enabled INTEGER NOT NULL DEFAULT 1,
        reuse_action TEXT NOT NULL DEFAULT 'client_subject',
        reuse_leeway_secs INTEGER NOT NULL DEFAULT 30,
        row_version INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT NOT NULL
    );"#,
];

/// An empty in-memory database with the full schema.
pub async fn test_db() -> DatabaseConnection {
    let db = Database::connect("sqlite::memory:").await.expect("connect");
    for ddl in SCHEMA {
        db.execute(Statement::from_string(DbBackend::Sqlite, *ddl))
            .await
            .expect("create table");
    }
    db
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        issuer_url: "https://id.example.org".into(),
        development_mode: true,
        session_secret: "0123456789abcdef0123456789abcdef".into(),
        admin_token: "test-admin-token".into(),
        allowed_scopes: vec!["openid".into(), "profile".into(), "email".into()],
        audience: None,
        clock_skew_secs: 60,
        password_grant_enabled: false,
        auth_code_ttl_secs: 600,
        session_ttl_secs: 3600,
        rotation: KeyRotationConfig::default(),
        token_ttl_defaults: TokenTtlDefaults::default(),
        cleanup_interval_secs: 3600,
        retention_days: 30,
        db_connect_timeout_secs: 8,
        db_acquire_timeout_secs: 8,
        listen_addr: "127.0.0.1:0".into(),
    }
}

/// A fully bootstrapped server state: schema, signing key and policy row.
pub async fn bootstrapped_state(config: AppConfig) -> OAuth2State {
    let db = Arc::new(test_db().await);
    let config = Arc::new(config);
    let state = OAuth2State::new(db, config.clone());
    state.keyring.ensure_initialized().await.expect("keyring");
    state
        .policies
        .ensure_seeded(&config.token_ttl_defaults)
        .await
        .expect("policy seed");
    state
}

/// The production router surface as a `TestServer`.
pub fn test_server(state: &OAuth2State) -> TestServer {
    let (router, _api) = OpenApiRouter::new()
        .merge(oauth2::router(state.clone()))
        .merge(oauth2::consent::router().with_state(state.clone()))
        .merge(oauth2::login::router().with_state(state.clone()))
        .nest("/api/admin", admin::router(state.clone()))
        .split_for_parts();
    TestServer::new(router).expect("test server")
}

/// Base client model; tests tweak fields before inserting.
pub fn client_model(id: &str) -> client::Model {
    let now = OffsetDateTime::now_utc();
    client::Model {
        id: id.to_string(),
        secret: None,
        name: format!("Test client {id}"),
        redirect_uris: r#"["https://app/cb"]"#.into(),
        grant_types: "authorization_code refresh_token".into(),
        scopes: "openid profile email".into(),
        is_public: true,
        require_pkce: false,
        enabled: true,
        password_grant_enabled: false,
        password_scopes: None,
        created_at: now,
        updated_at: now,
    }
}

pub async fn insert_client(db: &DatabaseConnection, model: client::Model) {
    client::Entity::insert(model.into_active_model())
        .exec(db)
        .await
        .expect("insert client");
}

pub fn user_model(id: &str, email: &str) -> user::Model {
    let now = OffsetDateTime::now_utc();
    user::Model {
        id: id.to_string(),
        email: email.to_string(),
        email_verified: true,
        name: Some("Test User".into()),
        password_hash: None,
        active: true,
        anonymized: false,
        created_at: now,
        last_login_at: None,
    }
}

pub async fn insert_user(db: &DatabaseConnection, model: user::Model) {
    user::Entity::insert(model.into_active_model())
        .exec(db)
        .await
        .expect("insert user");
}

pub async fn insert_user_with_password(
    db: &DatabaseConnection,
    id: &str,
    email: &str,
    password: &str,
) {
    let mut model = user_model(id, email);
    model.password_hash = Some(hash_password(password).expect("hash"));
    insert_user(db, model).await;
}

/// Adjust the policy row's rotation/reuse flags in place.
pub async fn set_policy_flags(
    db: &DatabaseConnection,
    rotation_enabled: bool,
    reuse_detection_enabled: bool,
    reuse_leeway_secs: i64,
    reuse_action: &str,
) {
    token_policy::Entity::update_many()
        .col_expr(
            token_policy::Column::RefreshRotationEnabled,
            Expr::value(rotation_enabled),
        )
        .col_expr(
            token_policy::Column::ReuseDetectionEnabled,
            Expr::value(reuse_detection_enabled),
        )
        .col_expr(
            token_policy::Column::ReuseLeewaySecs,
            Expr::value(reuse_leeway_secs),
        )
        .col_expr(token_policy::Column::ReuseAction, Expr::value(reuse_action))
        .filter(token_policy::Column::Id.eq(token_policy::SINGLETON_ID))
        .exec(db)
        .await
        .expect("update policy");
}

/// Cookie header value for an authenticated browser session.
pub fn session_cookie_header(state: &OAuth2State, user_id: &str) -> (HeaderName, HeaderValue) {
    let value = state
        .sessions
        .mint_session(user_id, time::Duration::hours(1));
    (
        HeaderName::from_static("cookie"),
        HeaderValue::from_str(&format!("op_session={value}")).expect("cookie header"),
    )
}

pub fn bearer_header(token: &str) -> (HeaderName, HeaderValue) {
    (
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&format!("Bearer {token}")).expect("bearer header"),
    )
}

/// PKCE S256 challenge for a verifier.
pub fn s256_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Pull the `code` query parameter out of a redirect Location.
pub fn code_from_location(location: &str) -> String {
    let url = url::Url::parse(location).expect("redirect location");
    url.query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
        .expect("code in redirect")
}

pub async fn find_token_by_access(db: &DatabaseConnection, access_token: &str) -> token::Model {
    token::Entity::find()
        .filter(token::Column::AccessToken.eq(access_token))
        .one(db)
        .await
        .expect("query token")
        .expect("token row")
}
