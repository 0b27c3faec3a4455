use thiserror::Error;

/// RFC 6749 / OIDC core protocol errors returned to OAuth clients.
/// These carry no internal detail; anything diagnostic goes to tracing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("invalid_client")]
    InvalidClient,
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("unauthorized_client: {0}")]
    UnauthorizedClient(String),
    #[error("invalid_scope: {0}")]
    InvalidScope(String),
    #[error("unsupported_grant_type")]
    UnsupportedGrantType,
    #[error("unsupported_response_type")]
    UnsupportedResponseType,
    #[error("access_denied")]
    AccessDenied,
    #[error("interaction_required")]
    InteractionRequired,
    #[error("login_required")]
    LoginRequired,
    #[error("server_error")]
    ServerError,
}

impl ProtocolError {
    /// Wire error code, as it appears in the `error` response field.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidRequest(_) => "invalid_request",
            ProtocolError::InvalidClient => "invalid_client",
            ProtocolError::InvalidGrant(_) => "invalid_grant",
            ProtocolError::UnauthorizedClient(_) => "unauthorized_client",
            ProtocolError::InvalidScope(_) => "invalid_scope",
            ProtocolError::UnsupportedGrantType => "unsupported_grant_type",
            ProtocolError::UnsupportedResponseType => "unsupported_response_type",
            ProtocolError::AccessDenied => "access_denied",
            ProtocolError::InteractionRequired => "interaction_required",
            ProtocolError::LoginRequired => "login_required",
            ProtocolError::ServerError => "server_error",
        }
    }

    /// Human-readable description for the `error_description` field, if any.
    pub fn description(&self) -> Option<String> {
        match self {
            ProtocolError::InvalidRequest(d)
            | ProtocolError::InvalidGrant(d)
            | ProtocolError::UnauthorizedClient(d)
            | ProtocolError::InvalidScope(d) => Some(d.clone()),
            ProtocolError::AccessDenied => Some("User denied the request".to_string()),
            _ => None,
        }
    }
}

/// Failures inside the issuance and key-management services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Db(#[from] sea_orm::DbErr),
    /// Optimistic-lock loser on a row_version-guarded update
    #[error("concurrent update conflict, reload and retry")]
    Conflict,
    #[error("key ring has no active signing key")]
    NoActiveKey,
    #[error("cannot retire the active signing key")]
    RetireActiveKey,
    #[error("unknown signing key: {0}")]
    UnknownKey(String),
    #[error("JWT error: {0}")]
    Jwt(String),
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl ServiceError {
    /// Transient failures a caller may retry. The core issuance decision is
    /// never retried; this exists for idempotent admin and background work.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Db(sea_orm::DbErr::Conn(_) | sea_orm::DbErr::ConnectionAcquire(_))
        )
    }
}

impl From<ServiceError> for ProtocolError {
    fn from(err: ServiceError) -> Self {
        // Storage or crypto trouble on the issuance path fails closed.
        tracing::error!(error = %err, "service failure during protocol handling");
        ProtocolError::ServerError
    }
}
