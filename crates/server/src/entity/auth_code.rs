//! Authorization code entity.
//!
//! Codes are single-use: redemption flips `status` from valid to redeemed
//! with an atomic conditional update, so a replayed code always fails.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const STATUS_VALID: &str = "valid";
pub const STATUS_REDEEMED: &str = "redeemed";
pub const STATUS_REVOKED: &str = "revoked";

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "auth_code")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub code: String,
    pub client_id: String,
    pub user_id: String,
    /// Consent grant this code was minted under
    pub authorization_id: Option<String>,
    pub redirect_uri: String,
    pub scope: String,
    /// OpenID Connect nonce
    pub nonce: Option<String>,
    /// PKCE code challenge
    pub code_challenge: Option<String>,
    /// PKCE code challenge method (S256 or plain)
    pub code_challenge_method: Option<String>,
    /// "valid", "redeemed" or "revoked"
    pub status: String,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Check if this authorization code has expired
    pub fn is_expired(&self) -> bool {
        self.expires_at < OffsetDateTime::now_utc()
    }

    /// Verify PKCE code verifier against stored challenge
    pub fn verify_pkce(&self, code_verifier: &str) -> bool {
        match (&self.code_challenge, &self.code_challenge_method) {
            (Some(challenge), Some(method)) => match method.as_str() {
                "S256" => {
                    use sha2::{Digest, Sha256};
                    let mut hasher = Sha256::new();
                    hasher.update(code_verifier.as_bytes());
                    let hash = hasher.finalize();
                    let computed = base64_url_encode(&hash);
                    computed == *challenge
                }
                "plain" => code_verifier == challenge,
                _ => false,
            },
            // No PKCE required if not provided during authorization
            (None, None) => true,
            _ => false,
        }
    }
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use sha2::{Digest, Sha256};

    fn code_with_challenge(challenge: Option<&str>, method: Option<&str>) -> Model {
        let now = OffsetDateTime::now_utc();
        Model {
            code: "code-1".into(),
            client_id: "client-1".into(),
            user_id: "user-1".into(),
            authorization_id: None,
            redirect_uri: "https://app/cb".into(),
            scope: "openid".into(),
            nonce: None,
            code_challenge: challenge.map(String::from),
            code_challenge_method: method.map(String::from),
            status: STATUS_VALID.into(),
            expires_at: now + time::Duration::minutes(10),
            created_at: now,
        }
    }

    #[test]
    fn s256_challenge_verifies() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize());

        let code = code_with_challenge(Some(&challenge), Some("S256"));
        assert!(code.verify_pkce(verifier));
        assert!(!code.verify_pkce("wrong-verifier"));
    }

    #[test]
    fn plain_challenge_compares_directly() {
        let code = code_with_challenge(Some("plain-value"), Some("plain"));
        assert!(code.verify_pkce("plain-value"));
        assert!(!code.verify_pkce("other"));
    }

    #[test]
    fn missing_challenge_passes_without_verifier_check() {
        let code = code_with_challenge(None, None);
        assert!(code.verify_pkce("anything"));
    }

    #[test]
    fn unknown_method_fails() {
        let code = code_with_challenge(Some("x"), Some("S512"));
        assert!(!code.verify_pkce("x"));
    }
}
