//! Signed browser sessions and flow tokens.
//!
//! The authorize endpoint needs to know who the browser is across the
//! login and consent round-trips. Both the session cookie and the consent
//! token are HMAC-SHA256 signed JSON payloads; tampering or truncation
//! fails verification, never panics.

use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::hmac;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Name of the authenticated-session cookie.
pub const SESSION_COOKIE: &str = "op_session";

/// An authenticated browser session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc().unix_timestamp() > self.expires_at
    }
}

/// HMAC signer shared by session cookies and consent tokens.
#[derive(Clone)]
pub struct SessionKeys {
    key: hmac::Key,
}

impl SessionKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Sign any serializable payload into `b64(json).b64(mac)` form.
    pub fn sign<T: Serialize>(&self, payload: &T) -> String {
        let json = serde_json::to_vec(payload).unwrap_or_default();
        let body = URL_SAFE_NO_PAD.encode(&json);
        let mac = hmac::sign(&self.key, body.as_bytes());
        format!("{}.{}", body, URL_SAFE_NO_PAD.encode(mac.as_ref()))
    }

    /// Verify and decode a token produced by [`sign`]. Returns None on any
    /// structural or signature failure.
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Option<T> {
        let (body, mac) = token.split_once('.')?;
        let mac_bytes = URL_SAFE_NO_PAD.decode(mac).ok()?;
        hmac::verify(&self.key, body.as_bytes(), &mac_bytes).ok()?;
        let json = URL_SAFE_NO_PAD.decode(body).ok()?;
        serde_json::from_slice(&json).ok()
    }

    /// Mint a session cookie value for a subject.
    pub fn mint_session(&self, user_id: &str, ttl: Duration) -> String {
        let now = OffsetDateTime::now_utc();
        self.sign(&Session {
            user_id: user_id.to_string(),
            issued_at: now.unix_timestamp(),
            expires_at: (now + ttl).unix_timestamp(),
        })
    }

    /// Extract a live session from the request's Cookie header.
    pub fn session_from_headers(&self, headers: &HeaderMap) -> Option<Session> {
        let cookies = headers.get("cookie")?.to_str().ok()?;
        let value = cookies.split(';').find_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            (name == SESSION_COOKIE).then_some(value)
        })?;
        let session: Session = self.verify(value)?;
        if session.is_expired() {
            return None;
        }
        Some(session)
    }
}

/// Set-Cookie value establishing a session.
pub fn session_cookie(value: &str, max_age: Duration) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        value,
        max_age.whole_seconds()
    )
}

/// Set-Cookie value clearing the session.
pub fn clear_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}
