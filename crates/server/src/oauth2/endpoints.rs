//! OAuth2/OIDC protocol endpoints.
//!
//! Implements the authorization server surface:
//! - Authorization endpoint (`/connect/authorize`)
//! - Token endpoint (`/connect/token`) with grant dispatch
//! - UserInfo (`/connect/userinfo`)
//! - RP-initiated logout (`/connect/logout`)
//! - JWKS (`/.well-known/jwks.json`)
//! - Discovery document (`/.well-known/openid-configuration`)

use crate::entity::{auth_code, authorization, client, token, user};
use crate::error::{ProtocolError, ServiceError};
use crate::oauth2::consent::{ConsentData, consent_redirect_url};
use crate::oauth2::incident::Severity;
use crate::oauth2::jwt::{AccessTokenClaims, IdTokenClaims};
use crate::oauth2::policy::{self, PolicyRequest, Stage};
use crate::oauth2::reuse::{RefreshRedemption, hash_refresh_token};
use crate::oauth2::session::clear_session_cookie;
use crate::oauth2::state::{OAuth2State, RequestContext};
use crate::oauth2::token_policy::{self, PolicySnapshot};
use axum::{
    Form, Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// OpenAPI tag for the protocol endpoints.
pub const OAUTH2_TAG: &str = "OAuth2";

/// Creates the protocol router.
pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(authorize, authorize_post))
        .routes(routes!(token))
        .routes(routes!(userinfo))
        .routes(routes!(logout))
        .routes(routes!(jwks))
        .routes(routes!(openid_configuration))
        .with_state(state)
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// OAuth2 authorization request parameters.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AuthorizeRequest {
    /// Must be "code" for Authorization Code flow
    pub response_type: String,
    /// Client identifier issued during registration
    pub client_id: String,
    /// Redirect URI (must exactly match a registered URI)
    pub redirect_uri: Option<String>,
    /// Space-separated list of requested scopes
    pub scope: Option<String>,
    /// Opaque value for CSRF protection
    pub state: Option<String>,
    /// String for replay protection (included in the ID token)
    pub nonce: Option<String>,
    /// PKCE code challenge (base64url-encoded)
    pub code_challenge: Option<String>,
    /// PKCE method: "S256" or "plain"
    pub code_challenge_method: Option<String>,
    /// "none" forbids interaction; "login" and "consent" force it
    pub prompt: Option<String>,
    /// Email hint to pre-fill the login form
    pub login_hint: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub code_verifier: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LogoutRequest {
    pub id_token_hint: Option<String>,
    pub post_logout_redirect_uri: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserInfoResponse {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub end_session_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

// =============================================================================
// Authorization endpoint
// =============================================================================

/// OAuth2 Authorization endpoint (GET).
#[tracing::instrument(skip(state, headers, params))]
#[utoipa::path(
    get,
    path = "/connect/authorize",
    tag = OAUTH2_TAG,
    operation_id = "Authorize",
    summary = "Initiate the Authorization Code flow",
    description = "Validates the client and its policy, resolves the browser session and any \
                   remembered consent, then either issues an authorization code silently, \
                   renders the consent step, or redirects to login.\n\n\
                   **PKCE:** clients flagged as PKCE-required must send `code_challenge` \
                   (S256 recommended).\n\n\
                   **prompt=none:** fails with `login_required` or `interaction_required` \
                   instead of interacting.",
    params(
        ("response_type" = String, Query, description = "Must be `code`."),
        ("client_id" = String, Query, description = "The registered client identifier."),
        ("redirect_uri" = Option<String>, Query, description = "Exact-match registered redirect URI."),
        ("scope" = Option<String>, Query, description = "Space-separated requested scopes; unknown scopes are dropped."),
        ("state" = Option<String>, Query, description = "Opaque CSRF value, returned unchanged."),
        ("nonce" = Option<String>, Query, description = "Replay protection, echoed in the ID token."),
        ("code_challenge" = Option<String>, Query, description = "PKCE code challenge."),
        ("code_challenge_method" = Option<String>, Query, description = "`S256` or `plain`."),
        ("prompt" = Option<String>, Query, description = "`none`, `login` or `consent`."),
        ("login_hint" = Option<String>, Query, description = "Email hint for the login form."),
    ),
    responses(
        (status = 303, description = "Redirect: code delivery, consent step or login"),
        (status = 400, description = "Invalid client or redirect URI", body = ErrorResponse),
    )
)]
pub async fn authorize(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeRequest>,
) -> Response {
    authorize_inner(state, headers, params).await
}

/// OAuth2 Authorization endpoint (POST form variant).
#[tracing::instrument(skip(state, headers, params))]
#[utoipa::path(
    post,
    path = "/connect/authorize",
    tag = OAUTH2_TAG,
    operation_id = "Authorize (POST)",
    summary = "Authorization Code flow via form POST",
    request_body(
        content = AuthorizeRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Authorization request parameters"
    ),
    responses(
        (status = 303, description = "Redirect: code delivery, consent step or login"),
        (status = 400, description = "Invalid client or redirect URI", body = ErrorResponse),
    )
)]
pub async fn authorize_post(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(params): Form<AuthorizeRequest>,
) -> Response {
    authorize_inner(state, headers, params).await
}

async fn authorize_inner(
    state: OAuth2State,
    headers: HeaderMap,
    params: AuthorizeRequest,
) -> Response {
    let ctx = RequestContext::new().with_client(&params.client_id);

    // Resolve the client first; nothing can be trusted without it.
    let client = match client::Entity::find_by_id(&params.client_id)
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(c)) => c,
        Ok(None) => {
            return protocol_error_json(&ProtocolError::InvalidClient);
        }
        Err(e) => {
            tracing::error!(trace_id = %ctx.trace_id, "Database error looking up client: {}", e);
            return protocol_error_json(&ProtocolError::ServerError);
        }
    };

    // Disabled clients fail before consent is ever touched.
    if !client.enabled {
        state.incidents.log_incident(
            "disabled_client_authorize_attempt",
            Severity::Warning,
            None,
            Some(&client.id),
            "authorization attempt by disabled client",
        );
        return protocol_error_json(&ProtocolError::InvalidClient);
    }

    // Client policy, in rule order. A violation may only be delivered by
    // redirect when the redirect URI itself is trustworthy.
    let requested_scopes: Vec<String> = params
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(String::from)
        .collect();
    let policy_request = PolicyRequest {
        stage: Stage::Authorize,
        grant_type: client::GRANT_AUTHORIZATION_CODE,
        redirect_uri: params.redirect_uri.as_deref(),
        code_challenge: params.code_challenge.as_deref(),
        requested_scopes: &requested_scopes,
    };
    if let Err(violation) = policy::enforce(&policy_request, &client) {
        state
            .incidents
            .rule_violation(violation.rule, &client.id, &violation.error.to_string());
        let redirect_ok = params
            .redirect_uri
            .as_deref()
            .map(|uri| client.is_redirect_uri_allowed(uri))
            .unwrap_or(false);
        if violation.rule == policy::RULE_REDIRECT_EXACT_MATCH || !redirect_ok {
            return protocol_error_json(&violation.error);
        }
        return error_redirect(
            params.redirect_uri.as_deref(),
            params.state.as_deref(),
            &violation.error,
        );
    }

    // From here the redirect target is validated (or defaulted).
    let redirect_uri = match &params.redirect_uri {
        Some(uri) => uri.clone(),
        None => {
            let uris = client.redirect_uris_list();
            match uris.first() {
                Some(uri) => uri.clone(),
                None => {
                    return protocol_error_json(&ProtocolError::InvalidRequest(
                        "No redirect_uri configured".to_string(),
                    ));
                }
            }
        }
    };

    if params.response_type != "code" {
        return error_redirect(
            Some(&redirect_uri),
            params.state.as_deref(),
            &ProtocolError::UnsupportedResponseType,
        );
    }

    // Unknown and unauthorized scopes are intersected away, never rejected.
    let scopes = state.intersect_scopes(&client, params.scope.as_deref());
    let prompt = params.prompt.as_deref().unwrap_or_default();

    // Resolve the browser session.
    let session_user = match resolve_session_user(&state, &headers).await {
        Ok(user) => user,
        Err(e) => return protocol_error_json(&e),
    };

    let user = match session_user {
        Some(user) if !prompt.contains("login") => user,
        _ => {
            // Nobody is authenticated (or re-authentication was demanded).
            if prompt.contains("none") {
                return error_redirect(
                    Some(&redirect_uri),
                    params.state.as_deref(),
                    &ProtocolError::LoginRequired,
                );
            }
            return Redirect::to(&login_redirect_url(&params, &redirect_uri, &scopes))
                .into_response();
        }
    };
    let ctx = ctx.with_subject(&user.id);

    // Consent resolution: a valid permanent grant covering the scopes lets
    // the flow complete silently.
    let permanent = match find_permanent_grant(&state, &user.id, &client.id).await {
        Ok(found) => found,
        Err(e) => {
            tracing::error!(trace_id = %ctx.trace_id, error = %e, "consent lookup failed");
            return protocol_error_json(&ProtocolError::ServerError);
        }
    };

    if let Some(grant) = &permanent
        && grant.covers_scopes(&scopes)
        && !prompt.contains("consent")
    {
        return match mint_auth_code(
            &state,
            &client,
            &user.id,
            Some(grant.id.clone()),
            &redirect_uri,
            &scopes.join(" "),
            &params,
        )
        .await
        {
            Ok(code) => code_redirect(&redirect_uri, &code, params.state.as_deref()),
            Err(e) => protocol_error_json(&e),
        };
    }

    if prompt.contains("none") {
        return error_redirect(
            Some(&redirect_uri),
            params.state.as_deref(),
            &ProtocolError::InteractionRequired,
        );
    }

    // Render the consent step.
    let consent = ConsentData {
        user_id: user.id.clone(),
        user_email: user.email.clone(),
        client_id: client.id.clone(),
        redirect_uri: redirect_uri.clone(),
        scope: scopes.join(" "),
        state: params.state.clone().unwrap_or_default(),
        nonce: params.nonce.clone(),
        code_challenge: params.code_challenge.clone(),
        code_challenge_method: params.code_challenge_method.clone(),
        expires_at: (OffsetDateTime::now_utc() + time::Duration::minutes(10)).unix_timestamp(),
    };
    Redirect::to(&consent_redirect_url(&state.sessions, &consent)).into_response()
}

async fn resolve_session_user(
    state: &OAuth2State,
    headers: &HeaderMap,
) -> Result<Option<user::Model>, ProtocolError> {
    let Some(session) = state.sessions.session_from_headers(headers) else {
        return Ok(None);
    };
    let found = state
        .users
        .find_by_subject(&session.user_id)
        .await
        .map_err(ProtocolError::from)?;
    match found {
        Some(user) if user.is_usable() => Ok(Some(user)),
        Some(user) => {
            state.incidents.log_incident(
                "disabled_user_session",
                Severity::Warning,
                Some(&user.id),
                None,
                "session presented for deactivated or anonymized subject",
            );
            Ok(None)
        }
        None => Ok(None),
    }
}

async fn find_permanent_grant(
    state: &OAuth2State,
    user_id: &str,
    client_id: &str,
) -> Result<Option<authorization::Model>, ServiceError> {
    Ok(authorization::Entity::find()
        .filter(authorization::Column::UserId.eq(user_id))
        .filter(authorization::Column::ClientId.eq(client_id))
        .filter(authorization::Column::Kind.eq(authorization::KIND_PERMANENT))
        .filter(authorization::Column::Status.eq(authorization::STATUS_VALID))
        .one(state.db.as_ref())
        .await?)
}

/// Insert a fresh single-use authorization code.
pub(crate) async fn mint_auth_code(
    state: &OAuth2State,
    client: &client::Model,
    user_id: &str,
    authorization_id: Option<String>,
    redirect_uri: &str,
    scope: &str,
    params: &AuthorizeRequest,
) -> Result<String, ProtocolError> {
    let code = OAuth2State::generate_token();
    let now = OffsetDateTime::now_utc();
    let record = auth_code::ActiveModel {
        code: Set(code.clone()),
        client_id: Set(client.id.clone()),
        user_id: Set(user_id.to_string()),
        authorization_id: Set(authorization_id),
        redirect_uri: Set(redirect_uri.to_string()),
        scope: Set(scope.to_string()),
        nonce: Set(params.nonce.clone()),
        code_challenge: Set(params.code_challenge.clone()),
        code_challenge_method: Set(params.code_challenge_method.clone()),
        status: Set(auth_code::STATUS_VALID.to_string()),
        expires_at: Set(now + time::Duration::seconds(state.config.auth_code_ttl_secs)),
        created_at: Set(now),
    };
    record
        .insert(state.db.as_ref())
        .await
        .map_err(|e| ProtocolError::from(ServiceError::from(e)))?;
    Ok(code)
}

fn login_redirect_url(params: &AuthorizeRequest, redirect_uri: &str, scopes: &[String]) -> String {
    let mut url = format!(
        "/connect/login?client_id={}&redirect_uri={}&scope={}&state={}",
        urlencoding::encode(&params.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&scopes.join(" ")),
        urlencoding::encode(params.state.as_deref().unwrap_or("")),
    );
    if let Some(ref nonce) = params.nonce {
        url.push_str(&format!("&nonce={}", urlencoding::encode(nonce)));
    }
    if let Some(ref challenge) = params.code_challenge {
        url.push_str(&format!(
            "&code_challenge={}&code_challenge_method={}",
            urlencoding::encode(challenge),
            urlencoding::encode(params.code_challenge_method.as_deref().unwrap_or("plain"))
        ));
    }
    if let Some(ref hint) = params.login_hint {
        url.push_str(&format!("&login_hint={}", urlencoding::encode(hint)));
    }
    url
}

pub(crate) fn code_redirect(redirect_uri: &str, code: &str, state: Option<&str>) -> Response {
    let mut url = redirect_uri.to_string();
    url.push_str(if url.contains('?') { "&" } else { "?" });
    url.push_str(&format!("code={}", urlencoding::encode(code)));
    if let Some(state) = state
        && !state.is_empty()
    {
        url.push_str(&format!("&state={}", urlencoding::encode(state)));
    }
    Redirect::to(&url).into_response()
}

// =============================================================================
// Token endpoint
// =============================================================================

/// OAuth2 Token endpoint.
#[tracing::instrument(skip(state, headers, params))]
#[utoipa::path(
    post,
    path = "/connect/token",
    tag = OAUTH2_TAG,
    operation_id = "Token",
    summary = "Exchange a grant for tokens",
    description = "Dispatches on `grant_type`:\n\
                   - `authorization_code` (with PKCE verification)\n\
                   - `refresh_token` (rotation and reuse detection per policy)\n\
                   - `client_credentials`\n\
                   - `password` (restricted integration clients, if enabled)\n\n\
                   **Client authentication:** HTTP Basic or form body; confidential \
                   client secrets are compared in constant time.",
    request_body(
        content = TokenRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token request parameters"
    ),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "Invalid grant or request", body = ErrorResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn token(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Form(params): Form<TokenRequest>,
) -> Response {
    let (client_id, client_secret) = extract_client_credentials(&headers, &params);

    let client_id = match client_id {
        Some(id) => id,
        None => {
            return protocol_error_json(&ProtocolError::InvalidRequest(
                "client_id is required".to_string(),
            ));
        }
    };

    let client = match client::Entity::find_by_id(&client_id)
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(c)) => c,
        Ok(None) => return protocol_error_json(&ProtocolError::InvalidClient),
        Err(e) => {
            tracing::error!("Database error looking up client: {}", e);
            return protocol_error_json(&ProtocolError::ServerError);
        }
    };

    if !client.enabled {
        state.incidents.log_incident(
            "disabled_client_token_attempt",
            Severity::Warning,
            None,
            Some(&client.id),
            "token request by disabled client",
        );
        return protocol_error_json(&ProtocolError::InvalidClient);
    }

    // Confidential clients must present their secret; comparison is
    // constant-time to avoid timing probes.
    if !client.is_public {
        let authenticated = match (&client.secret, &client_secret) {
            (Some(stored), Some(provided)) => {
                stored.as_bytes().ct_eq(provided.as_bytes()).into()
            }
            _ => false,
        };
        if !authenticated {
            state.incidents.log_incident(
                "client_authentication_failed",
                Severity::Warning,
                None,
                Some(&client.id),
                "invalid or missing client secret",
            );
            return protocol_error_json(&ProtocolError::InvalidClient);
        }
    }

    let result = match params.grant_type.as_str() {
        client::GRANT_AUTHORIZATION_CODE => {
            handle_authorization_code_grant(&state, &client, &params).await
        }
        client::GRANT_REFRESH_TOKEN => handle_refresh_token_grant(&state, &client, &params).await,
        client::GRANT_CLIENT_CREDENTIALS => {
            handle_client_credentials_grant(&state, &client, &params).await
        }
        client::GRANT_PASSWORD => handle_password_grant(&state, &client, &params).await,
        _ => Err(ProtocolError::UnsupportedGrantType),
    };

    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => protocol_error_json(&e),
    }
}

fn extract_client_credentials(
    headers: &HeaderMap,
    params: &TokenRequest,
) -> (Option<String>, Option<String>) {
    // Try Basic auth first
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        && let Ok(decoded) =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, auth)
        && let Ok(creds) = String::from_utf8(decoded)
        && let Some((id, secret)) = creds.split_once(':')
    {
        return (Some(id.to_string()), Some(secret.to_string()));
    }

    // Fall back to form body
    (params.client_id.clone(), params.client_secret.clone())
}

/// Re-validate client policy against the grant type actually being
/// exercised; authorize-time validation does not cover grant switching.
fn enforce_token_policy(
    state: &OAuth2State,
    client: &client::Model,
    grant_type: &str,
    requested_scopes: &[String],
) -> Result<(), ProtocolError> {
    let request = PolicyRequest {
        stage: Stage::Token,
        grant_type,
        redirect_uri: None,
        code_challenge: None,
        requested_scopes,
    };
    policy::enforce(&request, client).map_err(|violation| {
        state
            .incidents
            .rule_violation(violation.rule, &client.id, &violation.error.to_string());
        violation.error
    })
}

async fn handle_authorization_code_grant(
    state: &OAuth2State,
    client: &client::Model,
    params: &TokenRequest,
) -> Result<TokenResponse, ProtocolError> {
    enforce_token_policy(state, client, client::GRANT_AUTHORIZATION_CODE, &[])?;

    let code = params.code.as_deref().ok_or_else(|| {
        ProtocolError::InvalidRequest("code is required".to_string())
    })?;

    let auth = auth_code::Entity::find_by_id(code)
        .one(state.db.as_ref())
        .await
        .map_err(ServiceError::from)?
        .ok_or_else(|| ProtocolError::InvalidGrant("Authorization code not found".to_string()))?;

    if auth.is_expired() {
        return Err(ProtocolError::InvalidGrant(
            "Authorization code expired".to_string(),
        ));
    }
    if auth.client_id != client.id {
        return Err(ProtocolError::InvalidGrant("Client ID mismatch".to_string()));
    }
    if let Some(ref uri) = params.redirect_uri
        && &auth.redirect_uri != uri
    {
        return Err(ProtocolError::InvalidGrant(
            "Redirect URI mismatch".to_string(),
        ));
    }

    // PKCE: a stored challenge demands a matching verifier.
    if auth.code_challenge.is_some() {
        match params.code_verifier.as_deref() {
            Some(verifier) => {
                if !auth.verify_pkce(verifier) {
                    return Err(ProtocolError::InvalidGrant(
                        "PKCE verification failed".to_string(),
                    ));
                }
            }
            None => {
                return Err(ProtocolError::InvalidRequest(
                    "code_verifier is required".to_string(),
                ));
            }
        }
    }

    // Single use: the status transition is atomic, so a replayed code loses
    // here no matter how the requests interleave.
    let redeemed = auth_code::Entity::update_many()
        .col_expr(
            auth_code::Column::Status,
            Expr::value(auth_code::STATUS_REDEEMED),
        )
        .filter(auth_code::Column::Code.eq(&auth.code))
        .filter(auth_code::Column::Status.eq(auth_code::STATUS_VALID))
        .exec(state.db.as_ref())
        .await
        .map_err(ServiceError::from)?;
    if redeemed.rows_affected == 0 {
        state.incidents.log_incident(
            "auth_code_replay",
            Severity::High,
            Some(&auth.user_id),
            Some(&client.id),
            "replay of a consumed authorization code",
        );
        return Err(ProtocolError::InvalidGrant(
            "Authorization code already used".to_string(),
        ));
    }

    let user = require_usable_user(state, &auth.user_id, &client.id).await?;
    let policy = state.policies.current().await?;
    let include_refresh = client.is_grant_type_allowed(client::GRANT_REFRESH_TOKEN);

    issue_tokens(IssueTokens {
        state,
        policy: &policy,
        client,
        subject: &auth.user_id,
        scope: &auth.scope,
        authorization_id: auth.authorization_id.clone(),
        include_refresh,
        refresh_ceiling: None,
        id_token: Some(IdTokenContext {
            nonce: auth.nonce.clone(),
            email: user.email.clone(),
        }),
    })
    .await
}

async fn handle_refresh_token_grant(
    state: &OAuth2State,
    client: &client::Model,
    params: &TokenRequest,
) -> Result<TokenResponse, ProtocolError> {
    let requested_scopes: Vec<String> = params
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(String::from)
        .collect();
    enforce_token_policy(state, client, client::GRANT_REFRESH_TOKEN, &requested_scopes)?;

    let refresh_token = params.refresh_token.as_deref().ok_or_else(|| {
        ProtocolError::InvalidRequest("refresh_token is required".to_string())
    })?;

    let policy = state.policies.current().await?;

    match state.refresh.redeem(&policy, client, refresh_token).await? {
        RefreshRedemption::Rotated { prior } => {
            let user = require_usable_user(state, &prior.user_id, &client.id).await?;
            let scope = narrowed_scope(&prior.scope, &requested_scopes);
            issue_tokens(IssueTokens {
                state,
                policy: &policy,
                client,
                subject: &prior.user_id,
                scope: &scope,
                authorization_id: prior.authorization_id.clone(),
                include_refresh: true,
                refresh_ceiling: prior.refresh_absolute_expires_at,
                id_token: Some(IdTokenContext {
                    nonce: None,
                    email: user.email.clone(),
                }),
            })
            .await
        }
        RefreshRedemption::Reusable { current } => {
            let user = require_usable_user(state, &current.user_id, &client.id).await?;
            let now = OffsetDateTime::now_utc();
            state
                .refresh
                .slide_expiry(&current, now + policy.refresh_ttl)
                .await?;
            let scope = narrowed_scope(&current.scope, &requested_scopes);
            issue_tokens(IssueTokens {
                state,
                policy: &policy,
                client,
                subject: &current.user_id,
                scope: &scope,
                authorization_id: current.authorization_id.clone(),
                include_refresh: false,
                refresh_ceiling: None,
                id_token: Some(IdTokenContext {
                    nonce: None,
                    email: user.email.clone(),
                }),
            })
            .await
        }
    }
}

async fn handle_client_credentials_grant(
    state: &OAuth2State,
    client: &client::Model,
    params: &TokenRequest,
) -> Result<TokenResponse, ProtocolError> {
    let requested_scopes: Vec<String> = params
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(String::from)
        .collect();
    enforce_token_policy(
        state,
        client,
        client::GRANT_CLIENT_CREDENTIALS,
        &requested_scopes,
    )?;

    if client.is_public {
        return Err(ProtocolError::UnauthorizedClient(
            "client_credentials requires a confidential client".to_string(),
        ));
    }

    let scopes = state.intersect_scopes(client, params.scope.as_deref());
    let policy = state.policies.current().await?;

    // Machine tokens: the client is its own subject, no refresh token.
    issue_tokens(IssueTokens {
        state,
        policy: &policy,
        client,
        subject: &client.id,
        scope: &scopes.join(" "),
        authorization_id: None,
        include_refresh: false,
        refresh_ceiling: None,
        id_token: None,
    })
    .await
}

async fn handle_password_grant(
    state: &OAuth2State,
    client: &client::Model,
    params: &TokenRequest,
) -> Result<TokenResponse, ProtocolError> {
    if !state.config.password_grant_enabled {
        return Err(ProtocolError::UnsupportedGrantType);
    }

    // Unknown scopes are dropped before the allow-list rules run; scopes
    // the client is not entitled to are a hard policy failure, not a drop.
    let requested_scopes: Vec<String> = params
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .filter(|s| state.config.allowed_scopes.iter().any(|a| a == s))
        .map(String::from)
        .collect();
    enforce_token_policy(state, client, client::GRANT_PASSWORD, &requested_scopes)?;

    let username = params.username.as_deref().ok_or_else(|| {
        ProtocolError::InvalidRequest("username is required".to_string())
    })?;
    let password = params.password.as_deref().ok_or_else(|| {
        ProtocolError::InvalidRequest("password is required".to_string())
    })?;

    let user = state
        .users
        .authenticate(username, password)
        .await
        .map_err(ProtocolError::from)?;
    let Some(user) = user else {
        state.incidents.log_incident(
            "password_grant_authentication_failed",
            Severity::Warning,
            None,
            Some(&client.id),
            "resource owner credentials rejected",
        );
        return Err(ProtocolError::InvalidGrant(
            "invalid resource owner credentials".to_string(),
        ));
    };

    let policy = state.policies.current().await?;
    let include_refresh = client.is_grant_type_allowed(client::GRANT_REFRESH_TOKEN);
    let id_token = requested_scopes
        .iter()
        .any(|s| s == "openid")
        .then(|| IdTokenContext {
            nonce: None,
            email: user.email.clone(),
        });

    issue_tokens(IssueTokens {
        state,
        policy: &policy,
        client,
        subject: &user.id,
        scope: &requested_scopes.join(" "),
        authorization_id: None,
        include_refresh,
        refresh_ceiling: None,
        id_token,
    })
    .await
}

async fn require_usable_user(
    state: &OAuth2State,
    user_id: &str,
    client_id: &str,
) -> Result<user::Model, ProtocolError> {
    let user = state
        .users
        .find_by_subject(user_id)
        .await
        .map_err(ProtocolError::from)?;
    match user {
        Some(user) if user.is_usable() => Ok(user),
        Some(user) => {
            state.incidents.log_incident(
                "disabled_user_token_attempt",
                Severity::Warning,
                Some(&user.id),
                Some(client_id),
                "token request for deactivated or anonymized subject",
            );
            Err(ProtocolError::InvalidGrant(
                "subject is not active".to_string(),
            ))
        }
        None => Err(ProtocolError::InvalidGrant(
            "subject is not active".to_string(),
        )),
    }
}

/// RFC 6749 6: a refresh may request a narrower scope, never a wider one.
fn narrowed_scope(prior_scope: &str, requested: &[String]) -> String {
    if requested.is_empty() {
        return prior_scope.to_string();
    }
    let prior: Vec<&str> = prior_scope.split_whitespace().collect();
    let narrowed: Vec<&str> = requested
        .iter()
        .map(String::as_str)
        .filter(|s| prior.contains(s))
        .collect();
    if narrowed.is_empty() {
        prior_scope.to_string()
    } else {
        narrowed.join(" ")
    }
}

struct IdTokenContext {
    nonce: Option<String>,
    email: String,
}

struct IssueTokens<'a> {
    state: &'a OAuth2State,
    policy: &'a PolicySnapshot,
    client: &'a client::Model,
    subject: &'a str,
    scope: &'a str,
    authorization_id: Option<String>,
    include_refresh: bool,
    refresh_ceiling: Option<OffsetDateTime>,
    id_token: Option<IdTokenContext>,
}

/// Stamp lifetimes, sign with the active key, persist the pair, and shape
/// the wire response. Every grant branch funnels through here.
async fn issue_tokens(input: IssueTokens<'_>) -> Result<TokenResponse, ProtocolError> {
    let IssueTokens {
        state,
        policy,
        client,
        subject,
        scope,
        authorization_id,
        include_refresh,
        refresh_ceiling,
        id_token,
    } = input;

    let now = OffsetDateTime::now_utc();
    let stamped = token_policy::apply(policy, now, refresh_ceiling, include_refresh);

    let jti = uuid::Uuid::new_v4().to_string();
    let claims = AccessTokenClaims {
        iss: state.issuer().to_string(),
        sub: subject.to_string(),
        aud: state.config.audience.clone(),
        client_id: client.id.clone(),
        scope: scope.to_string(),
        jti: jti.clone(),
        exp: stamped.access_expires_at.unix_timestamp(),
        iat: now.unix_timestamp(),
    };
    let (access_token, kid) = state.keyring.sign(&claims).await?;

    let refresh_cleartext = include_refresh.then(OAuth2State::generate_token);
    let refresh_hash = refresh_cleartext.as_deref().map(hash_refresh_token);

    let record = token::ActiveModel {
        id: Set(jti),
        kid: Set(kid.clone()),
        access_token: Set(access_token.clone()),
        refresh_token: Set(refresh_hash),
        token_type: Set("Bearer".to_string()),
        client_id: Set(client.id.clone()),
        user_id: Set(subject.to_string()),
        authorization_id: Set(authorization_id),
        scope: Set(scope.to_string()),
        audience: Set(state.config.audience.clone()),
        status: Set(token::STATUS_VALID.to_string()),
        access_token_expires_at: Set(stamped.access_expires_at),
        refresh_token_expires_at: Set(stamped.refresh_expires_at),
        refresh_absolute_expires_at: Set(stamped.refresh_absolute_expires_at),
        created_at: Set(now),
        redeemed_at: Set(None),
        revoked_at: Set(None),
    };
    record
        .insert(state.db.as_ref())
        .await
        .map_err(ServiceError::from)?;

    let id_token = match id_token {
        Some(ctx) if scope.split_whitespace().any(|s| s == "openid") => {
            let id_claims = IdTokenClaims {
                iss: state.issuer().to_string(),
                sub: subject.to_string(),
                aud: client.id.clone(),
                exp: stamped.id_token_expires_at.unix_timestamp(),
                iat: now.unix_timestamp(),
                nonce: ctx.nonce,
                email: scope
                    .split_whitespace()
                    .any(|s| s == "email")
                    .then_some(ctx.email),
            };
            let (jwt, _) = state.keyring.sign(&id_claims).await?;
            Some(jwt)
        }
        _ => None,
    };

    tracing::info!(
        client_id = %client.id,
        subject = %subject,
        kid = %kid,
        refresh = include_refresh,
        "issued token pair"
    );

    Ok(TokenResponse {
        access_token,
        token_type: "Bearer".to_string(),
        expires_in: (stamped.access_expires_at - now).whole_seconds(),
        refresh_token: refresh_cleartext,
        id_token,
        scope: scope.to_string(),
    })
}

// =============================================================================
// UserInfo
// =============================================================================

/// OpenID Connect UserInfo endpoint.
#[tracing::instrument(skip(state, headers))]
#[utoipa::path(
    get,
    path = "/connect/userinfo",
    tag = OAUTH2_TAG,
    operation_id = "UserInfo",
    summary = "Claims about the authenticated subject",
    description = "Validates the Bearer access token by reference (so revocation is \
                   immediately visible here) and returns claims filtered by the \
                   token's granted scopes (`email`, `profile`).",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Subject claims", body = UserInfoResponse),
        (status = 401, description = "Missing, invalid or revoked access token", body = ErrorResponse),
        (status = 403, description = "Token lacks the openid scope", body = ErrorResponse),
    )
)]
pub async fn userinfo(State(state): State<OAuth2State>, headers: HeaderMap) -> Response {
    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let access_token = match auth_header {
        Some(token) => token,
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "invalid_token".to_string(),
                    error_description: Some(
                        "Missing or invalid Authorization header".to_string(),
                    ),
                }),
            )
                .into_response();
        }
    };

    // Validation is by reference: the stored record's status wins over the
    // signature, making revocation effective without waiting out the JWT.
    let token = match token::Entity::find()
        .filter(token::Column::AccessToken.eq(access_token))
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(t)) if t.is_valid() => t,
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "invalid_token".to_string(),
                    error_description: None,
                }),
            )
                .into_response();
        }
    };

    if !token.has_scope("openid") {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "insufficient_scope".to_string(),
                error_description: Some("Token does not have 'openid' scope".to_string()),
            }),
        )
            .into_response();
    }

    let user = match user::Entity::find_by_id(&token.user_id)
        .one(state.db.as_ref())
        .await
    {
        Ok(Some(u)) if u.is_usable() => u,
        Ok(Some(_)) | Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "invalid_token".to_string(),
                    error_description: None,
                }),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Database error looking up user: {}", e);
            return protocol_error_json(&ProtocolError::ServerError);
        }
    };

    let scopes = token.scopes_list();
    let mut response = UserInfoResponse {
        sub: user.id,
        email: None,
        email_verified: None,
        name: None,
    };
    if scopes.iter().any(|s| s == "email") {
        response.email = Some(user.email);
        response.email_verified = Some(user.email_verified);
    }
    if scopes.iter().any(|s| s == "profile") {
        response.name = user.name;
    }

    (StatusCode::OK, Json(response)).into_response()
}

// =============================================================================
// Logout
// =============================================================================

/// RP-initiated logout endpoint.
#[tracing::instrument(skip(state, params))]
#[utoipa::path(
    get,
    path = "/connect/logout",
    tag = OAUTH2_TAG,
    operation_id = "Logout",
    summary = "End the browser session",
    description = "Clears the session cookie. With a valid `id_token_hint` the subject's \
                   ad-hoc grants for that client are revoked, and a registered \
                   `post_logout_redirect_uri` is honoured.",
    params(
        ("id_token_hint" = Option<String>, Query, description = "ID token previously issued to the client."),
        ("post_logout_redirect_uri" = Option<String>, Query, description = "Registered URI to return to."),
        ("state" = Option<String>, Query, description = "Opaque value echoed on the redirect."),
    ),
    responses(
        (status = 303, description = "Redirect to the registered post-logout URI"),
        (status = 200, description = "Logout confirmation page"),
    )
)]
pub async fn logout(
    State(state): State<OAuth2State>,
    Query(params): Query<LogoutRequest>,
) -> Response {
    let mut redirect_target: Option<String> = None;

    if let Some(hint) = params.id_token_hint.as_deref() {
        match state.keyring.verify::<IdTokenClaims>(hint).await {
            Ok(claims) => {
                // Drop the session-scoped grants for this subject/client.
                let revoked = authorization::Entity::update_many()
                    .col_expr(
                        authorization::Column::Status,
                        Expr::value(authorization::STATUS_REVOKED),
                    )
                    .col_expr(
                        authorization::Column::UpdatedAt,
                        Expr::value(OffsetDateTime::now_utc()),
                    )
                    .filter(authorization::Column::UserId.eq(&claims.sub))
                    .filter(authorization::Column::ClientId.eq(&claims.aud))
                    .filter(authorization::Column::Kind.eq(authorization::KIND_AD_HOC))
                    .filter(authorization::Column::Status.eq(authorization::STATUS_VALID))
                    .exec(state.db.as_ref())
                    .await;
                if let Err(e) = revoked {
                    tracing::error!("Failed to revoke session grants on logout: {}", e);
                }

                if let Some(uri) = params.post_logout_redirect_uri.as_deref()
                    && let Ok(Some(client)) = client::Entity::find_by_id(&claims.aud)
                        .one(state.db.as_ref())
                        .await
                    && client.is_redirect_uri_allowed(uri)
                {
                    let mut url = uri.to_string();
                    if let Some(ref s) = params.state {
                        url.push_str(if url.contains('?') { "&" } else { "?" });
                        url.push_str(&format!("state={}", urlencoding::encode(s)));
                    }
                    redirect_target = Some(url);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "logout id_token_hint failed verification");
            }
        }
    }

    let cookie = clear_session_cookie();
    match redirect_target {
        Some(url) => (
            [(header::SET_COOKIE, cookie)],
            Redirect::to(&url),
        )
            .into_response(),
        None => (
            [(header::SET_COOKIE, cookie)],
            Html(
                "<!DOCTYPE html><html><head><title>Signed out</title></head>\
                 <body><h1>Signed out</h1><p>You have been signed out.</p></body></html>"
                    .to_string(),
            ),
        )
            .into_response(),
    }
}

// =============================================================================
// JWKS + Discovery
// =============================================================================

/// JSON Web Key Set endpoint.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = OAUTH2_TAG,
    operation_id = "JWKS",
    summary = "Published signing keys",
    description = "The active signing key plus any superseded keys still inside their \
                   verification grace window. Revoked and retired keys are excluded \
                   immediately.",
    responses(
        (status = 200, description = "JWKS document"),
    )
)]
pub async fn jwks(State(state): State<OAuth2State>) -> Response {
    match state.keyring.jwks_document().await {
        Ok(doc) => (StatusCode::OK, Json(doc)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to build JWKS document");
            protocol_error_json(&ProtocolError::ServerError)
        }
    }
}

/// OpenID Connect Discovery document.
#[tracing::instrument(skip(state))]
#[utoipa::path(
    get,
    path = "/.well-known/openid-configuration",
    tag = OAUTH2_TAG,
    operation_id = "Discovery",
    summary = "OpenID Connect provider metadata",
    responses(
        (status = 200, description = "Provider configuration document", body = OpenIdConfiguration),
    )
)]
pub async fn openid_configuration(State(state): State<OAuth2State>) -> Json<OpenIdConfiguration> {
    let issuer = state.issuer().to_string();
    let mut grant_types = vec![
        client::GRANT_AUTHORIZATION_CODE.to_string(),
        client::GRANT_REFRESH_TOKEN.to_string(),
        client::GRANT_CLIENT_CREDENTIALS.to_string(),
    ];
    if state.config.password_grant_enabled {
        grant_types.push(client::GRANT_PASSWORD.to_string());
    }
    Json(OpenIdConfiguration {
        authorization_endpoint: format!("{}/connect/authorize", issuer),
        token_endpoint: format!("{}/connect/token", issuer),
        userinfo_endpoint: format!("{}/connect/userinfo", issuer),
        end_session_endpoint: format!("{}/connect/logout", issuer),
        jwks_uri: format!("{}/.well-known/jwks.json", issuer),
        issuer,
        response_types_supported: vec!["code".to_string()],
        grant_types_supported: grant_types,
        subject_types_supported: vec!["public".to_string()],
        id_token_signing_alg_values_supported: vec!["ES256".to_string()],
        scopes_supported: state.config.allowed_scopes.clone(),
        token_endpoint_auth_methods_supported: vec![
            "client_secret_basic".to_string(),
            "client_secret_post".to_string(),
            "none".to_string(),
        ],
        code_challenge_methods_supported: vec!["S256".to_string(), "plain".to_string()],
    })
}

// =============================================================================
// Helper Functions
// =============================================================================

/// JSON error body for failures that must not (or cannot) be redirected.
pub(crate) fn protocol_error_json(error: &ProtocolError) -> Response {
    let status = match error {
        ProtocolError::InvalidClient => StatusCode::UNAUTHORIZED,
        ProtocolError::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.code().to_string(),
            error_description: error.description(),
        }),
    )
        .into_response()
}

/// Deliver a protocol error to the client's redirect URI, falling back to a
/// JSON body when no trustworthy redirect exists.
pub(crate) fn error_redirect(
    redirect_uri: Option<&str>,
    state: Option<&str>,
    error: &ProtocolError,
) -> Response {
    match redirect_uri {
        Some(uri) => {
            let mut redirect_url = match url::Url::parse(uri) {
                Ok(u) => u,
                Err(_) => return protocol_error_json(error),
            };

            redirect_url
                .query_pairs_mut()
                .append_pair("error", error.code());
            if let Some(desc) = error.description() {
                redirect_url
                    .query_pairs_mut()
                    .append_pair("error_description", &desc);
            }
            if let Some(s) = state {
                redirect_url.query_pairs_mut().append_pair("state", s);
            }

            Redirect::to(redirect_url.as_str()).into_response()
        }
        None => protocol_error_json(error),
    }
}
