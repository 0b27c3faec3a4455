//! JWT claim models and encode/decode helpers.
//!
//! Access and ID tokens are ES256 JWTs signed by the key ring's active
//! key. Verification resolves the `kid` header against the ring, so a
//! rotated-out or revoked key fails closed.

use crate::error::ServiceError;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub client_id: String,
    pub scope: String,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
}

/// Claims carried by an OpenID Connect ID token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    /// Audience is the client the token was issued to
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Encode claims with the given key, embedding `kid` in the header.
pub fn encode<T: Serialize>(
    claims: &T,
    kid: &str,
    key: &EncodingKey,
) -> Result<String, ServiceError> {
    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, claims, key).map_err(|e| ServiceError::Jwt(e.to_string()))
}

/// Extract the `kid` header from a serialized token without verifying it.
pub fn peek_kid(token: &str) -> Result<String, ServiceError> {
    let header =
        jsonwebtoken::decode_header(token).map_err(|e| ServiceError::Jwt(e.to_string()))?;
    header
        .kid
        .ok_or_else(|| ServiceError::Jwt("token header carries no kid".to_string()))
}

/// Decode and verify a token against a resolved public key.
pub fn decode<T: DeserializeOwned>(
    token: &str,
    key: &DecodingKey,
    issuer: &str,
    leeway_secs: u64,
) -> Result<T, ServiceError> {
    let mut validation = Validation::new(Algorithm::ES256);
    validation.set_issuer(&[issuer]);
    validation.validate_aud = false;
    validation.leeway = leeway_secs;
    jsonwebtoken::decode::<T>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| ServiceError::Jwt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_kid_rejects_garbage() {
        assert!(peek_kid("not-a-jwt").is_err());
    }
}
