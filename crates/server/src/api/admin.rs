//! Administration endpoints: token policy, signing keys, revocation.
//!
//! Guarded by a bearer admin token compared in constant time. Policy and
//! key writes use row-version optimistic concurrency; a losing writer gets
//! 409 and must reload and retry. Every change emits an audit incident.

use crate::entity::{signing_key, token_policy};
use crate::error::ServiceError;
use crate::oauth2::OAuth2State;
use crate::oauth2::incident::Severity;
use crate::oauth2::token_policy::{PolicyUpdate, ReuseAction};
use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// OpenAPI tag for admin endpoints.
pub const ADMIN_TAG: &str = "Administration";

/// Creates the admin router, nested under `/api/admin`.
pub fn router(state: OAuth2State) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(get_policy, put_policy))
        .routes(routes!(list_keys))
        .routes(routes!(rotate_key))
        .routes(routes!(retire_key))
        .routes(routes!(revoke_key))
        .routes(routes!(revoke_credentials))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PolicyResponse {
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub id_token_ttl_secs: i64,
    pub refresh_rotation_enabled: bool,
    pub reuse_detection_enabled: bool,
    pub reuse_action: String,
    pub reuse_leeway_secs: i64,
    pub row_version: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PolicyUpdateRequest {
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub id_token_ttl_secs: i64,
    pub refresh_rotation_enabled: bool,
    pub reuse_detection_enabled: bool,
    pub reuse_action: String,
    pub reuse_leeway_secs: i64,
    /// Version the caller read; a stale value yields 409
    pub row_version: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct KeySummary {
    pub kid: String,
    pub alg: String,
    pub status: String,
    pub created_at: i64,
    pub activated_at: Option<i64>,
    pub retire_after: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RotateResponse {
    pub kid: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevokeCredentialsRequest {
    pub user_id: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RevokeCredentialsResponse {
    pub tokens: u64,
    pub authorizations: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AdminError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

fn admin_error(status: StatusCode, error: &str, description: Option<&str>) -> Response {
    (
        status,
        Json(AdminError {
            error: error.to_string(),
            error_description: description.map(String::from),
        }),
    )
        .into_response()
}

/// Check the bearer admin token; constant-time comparison.
fn authorize_admin(state: &OAuth2State, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let authorized = provided
        .map(|p| {
            p.as_bytes()
                .ct_eq(state.config.admin_token.as_bytes())
                .into()
        })
        .unwrap_or(false);
    if authorized {
        Ok(())
    } else {
        Err(admin_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            Some("missing or invalid admin token"),
        ))
    }
}

/// Read the current token policy.
#[tracing::instrument(skip(state, headers))]
#[utoipa::path(
    get,
    path = "/policy",
    tag = ADMIN_TAG,
    operation_id = "Get Token Policy",
    summary = "Current token policy snapshot",
    responses(
        (status = 200, description = "Policy snapshot with its row version", body = PolicyResponse),
        (status = 401, description = "Missing or invalid admin token", body = AdminError),
    )
)]
pub async fn get_policy(State(state): State<OAuth2State>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }
    match state.policies.current().await {
        Ok(policy) => (
            StatusCode::OK,
            Json(PolicyResponse {
                access_ttl_secs: policy.access_ttl.whole_seconds(),
                refresh_ttl_secs: policy.refresh_ttl.whole_seconds(),
                id_token_ttl_secs: policy.id_token_ttl.whole_seconds(),
                refresh_rotation_enabled: policy.refresh_rotation_enabled,
                reuse_detection_enabled: policy.reuse_detection_enabled,
                reuse_action: policy.reuse_action.as_str().to_string(),
                reuse_leeway_secs: policy.reuse_leeway.whole_seconds(),
                row_version: policy.row_version,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to read token policy");
            admin_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
        }
    }
}

/// Replace the token policy under optimistic concurrency.
#[tracing::instrument(skip(state, headers, body))]
#[utoipa::path(
    put,
    path = "/policy",
    tag = ADMIN_TAG,
    operation_id = "Update Token Policy",
    summary = "Replace the token policy",
    description = "The supplied `row_version` must match the stored row; a stale version \
                   yields 409 and the caller must reload and retry.",
    request_body = PolicyUpdateRequest,
    responses(
        (status = 200, description = "Updated policy", body = PolicyResponse),
        (status = 400, description = "Validation failure", body = AdminError),
        (status = 401, description = "Missing or invalid admin token", body = AdminError),
        (status = 409, description = "Concurrent update conflict", body = AdminError),
    )
)]
pub async fn put_policy(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Json(body): Json<PolicyUpdateRequest>,
) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }

    if body.access_ttl_secs <= 0 || body.refresh_ttl_secs <= 0 || body.id_token_ttl_secs <= 0 {
        return admin_error(
            StatusCode::BAD_REQUEST,
            "invalid_policy",
            Some("TTLs must be positive"),
        );
    }
    if body.reuse_leeway_secs < 0 || body.reuse_leeway_secs > 300 {
        return admin_error(
            StatusCode::BAD_REQUEST,
            "invalid_policy",
            Some("reuse_leeway_secs must be between 0 and 300"),
        );
    }
    if body.reuse_action != token_policy::REUSE_ACTION_SUBJECT
        && body.reuse_action != token_policy::REUSE_ACTION_CLIENT_SUBJECT
    {
        return admin_error(
            StatusCode::BAD_REQUEST,
            "invalid_policy",
            Some("reuse_action must be 'subject' or 'client_subject'"),
        );
    }

    let update = PolicyUpdate {
        access_ttl_secs: body.access_ttl_secs,
        refresh_ttl_secs: body.refresh_ttl_secs,
        id_token_ttl_secs: body.id_token_ttl_secs,
        refresh_rotation_enabled: body.refresh_rotation_enabled,
        reuse_detection_enabled: body.reuse_detection_enabled,
        reuse_action: ReuseAction::from_str(&body.reuse_action),
        reuse_leeway_secs: body.reuse_leeway_secs,
    };

    match state.policies.update(update, body.row_version).await {
        Ok(policy) => {
            state.incidents.log_incident(
                "admin_policy_updated",
                Severity::Info,
                None,
                None,
                "token policy replaced via admin API",
            );
            (
                StatusCode::OK,
                Json(PolicyResponse {
                    access_ttl_secs: policy.access_ttl.whole_seconds(),
                    refresh_ttl_secs: policy.refresh_ttl.whole_seconds(),
                    id_token_ttl_secs: policy.id_token_ttl.whole_seconds(),
                    refresh_rotation_enabled: policy.refresh_rotation_enabled,
                    reuse_detection_enabled: policy.reuse_detection_enabled,
                    reuse_action: policy.reuse_action.as_str().to_string(),
                    reuse_leeway_secs: policy.reuse_leeway.whole_seconds(),
                    row_version: policy.row_version,
                }),
            )
                .into_response()
        }
        Err(ServiceError::Conflict) => admin_error(
            StatusCode::CONFLICT,
            "conflict",
            Some("policy changed concurrently; reload and retry"),
        ),
        Err(e) => {
            tracing::error!(error = %e, "failed to update token policy");
            admin_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
        }
    }
}

/// List signing keys (public metadata only).
#[tracing::instrument(skip(state, headers))]
#[utoipa::path(
    get,
    path = "/keys",
    tag = ADMIN_TAG,
    operation_id = "List Signing Keys",
    summary = "All signing keys with lifecycle state",
    responses(
        (status = 200, description = "Key metadata", body = [KeySummary]),
        (status = 401, description = "Missing or invalid admin token", body = AdminError),
    )
)]
pub async fn list_keys(State(state): State<OAuth2State>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }
    match state.keyring.list().await {
        Ok(keys) => {
            let summaries: Vec<KeySummary> = keys
                .into_iter()
                .map(|k: signing_key::Model| KeySummary {
                    kid: k.kid,
                    alg: k.alg,
                    status: k.status,
                    created_at: k.created_at.unix_timestamp(),
                    activated_at: k.activated_at.map(|t| t.unix_timestamp()),
                    retire_after: k.retire_after.map(|t| t.unix_timestamp()),
                })
                .collect();
            (StatusCode::OK, Json(summaries)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to list signing keys");
            admin_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
        }
    }
}

/// Trigger an immediate key rotation.
#[tracing::instrument(skip(state, headers))]
#[utoipa::path(
    post,
    path = "/keys/rotate",
    tag = ADMIN_TAG,
    operation_id = "Rotate Signing Key",
    summary = "Rotate the active signing key now",
    responses(
        (status = 200, description = "New active key id", body = RotateResponse),
        (status = 401, description = "Missing or invalid admin token", body = AdminError),
        (status = 409, description = "A concurrent rotation won", body = AdminError),
    )
)]
pub async fn rotate_key(State(state): State<OAuth2State>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }
    match state.keyring.rotate_now().await {
        Ok(kid) => {
            state.incidents.log_incident(
                "admin_key_rotated",
                Severity::Info,
                None,
                None,
                "manual signing key rotation",
            );
            (StatusCode::OK, Json(RotateResponse { kid })).into_response()
        }
        Err(ServiceError::Conflict) => admin_error(
            StatusCode::CONFLICT,
            "conflict",
            Some("another rotation completed concurrently"),
        ),
        Err(e) => {
            tracing::error!(error = %e, "manual key rotation failed");
            admin_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
        }
    }
}

/// Retire a superseded key ahead of its grace window.
#[tracing::instrument(skip(state, headers))]
#[utoipa::path(
    post,
    path = "/keys/{kid}/retire",
    tag = ADMIN_TAG,
    operation_id = "Retire Signing Key",
    summary = "Retire a non-active signing key",
    params(("kid" = String, Path, description = "Key identifier")),
    responses(
        (status = 204, description = "Key retired"),
        (status = 400, description = "The active key cannot be retired", body = AdminError),
        (status = 401, description = "Missing or invalid admin token", body = AdminError),
        (status = 404, description = "Unknown key", body = AdminError),
    )
)]
pub async fn retire_key(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Path(kid): Path<String>,
) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }
    match state.keyring.retire(&kid).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(ServiceError::RetireActiveKey) => admin_error(
            StatusCode::BAD_REQUEST,
            "active_key",
            Some("rotate before retiring the active key"),
        ),
        Err(ServiceError::UnknownKey(_)) => {
            admin_error(StatusCode::NOT_FOUND, "unknown_key", None)
        }
        Err(ServiceError::Conflict) => admin_error(
            StatusCode::CONFLICT,
            "conflict",
            Some("key changed concurrently; reload and retry"),
        ),
        Err(e) => {
            tracing::error!(error = %e, kid, "failed to retire key");
            admin_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
        }
    }
}

/// Revoke a key for incident response.
#[tracing::instrument(skip(state, headers))]
#[utoipa::path(
    post,
    path = "/keys/{kid}/revoke",
    tag = ADMIN_TAG,
    operation_id = "Revoke Signing Key",
    summary = "Revoke a signing key immediately",
    description = "Drops the key from JWKS and fails its signatures at once, whatever its \
                   state. Revoking the active key installs a fresh replacement.",
    params(("kid" = String, Path, description = "Key identifier")),
    responses(
        (status = 204, description = "Key revoked"),
        (status = 401, description = "Missing or invalid admin token", body = AdminError),
        (status = 404, description = "Unknown key", body = AdminError),
    )
)]
pub async fn revoke_key(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Path(kid): Path<String>,
) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }
    match state.keyring.revoke(&kid).await {
        Ok(()) => {
            state.incidents.log_incident(
                "admin_key_revoked",
                Severity::High,
                None,
                None,
                "signing key revoked via admin API",
            );
            StatusCode::NO_CONTENT.into_response()
        }
        Err(ServiceError::UnknownKey(_)) => {
            admin_error(StatusCode::NOT_FOUND, "unknown_key", None)
        }
        Err(ServiceError::Conflict) => admin_error(
            StatusCode::CONFLICT,
            "conflict",
            Some("key changed concurrently; reload and retry"),
        ),
        Err(e) => {
            tracing::error!(error = %e, kid, "failed to revoke key");
            admin_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
        }
    }
}

/// Cascade revocation by user, client, or pair.
#[tracing::instrument(skip(state, headers, body))]
#[utoipa::path(
    post,
    path = "/revoke",
    tag = ADMIN_TAG,
    operation_id = "Revoke Credentials",
    summary = "Revoke tokens and grants by user, client or pair",
    request_body = RevokeCredentialsRequest,
    responses(
        (status = 200, description = "Counts of revoked rows", body = RevokeCredentialsResponse),
        (status = 400, description = "Neither user_id nor client_id given", body = AdminError),
        (status = 401, description = "Missing or invalid admin token", body = AdminError),
    )
)]
pub async fn revoke_credentials(
    State(state): State<OAuth2State>,
    headers: HeaderMap,
    Json(body): Json<RevokeCredentialsRequest>,
) -> Response {
    if let Err(denied) = authorize_admin(&state, &headers) {
        return denied;
    }

    let result = match (body.user_id.as_deref(), body.client_id.as_deref()) {
        (Some(user), Some(client)) => state.revocation.revoke_user_client(user, client).await,
        (Some(user), None) => state.revocation.revoke_user(user).await,
        (None, Some(client)) => state.revocation.revoke_client(client).await,
        (None, None) => {
            return admin_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                Some("user_id or client_id is required"),
            );
        }
    };

    match result {
        Ok(outcome) => {
            state.incidents.log_incident(
                "admin_revocation",
                Severity::Info,
                body.user_id.as_deref(),
                body.client_id.as_deref(),
                "revocation cascade via admin API",
            );
            (
                StatusCode::OK,
                Json(RevokeCredentialsResponse {
                    tokens: outcome.tokens,
                    authorizations: outcome.authorizations,
                }),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "revocation cascade failed");
            admin_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
        }
    }
}
