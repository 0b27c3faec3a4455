//! Signing key ring.
//!
//! Owns the lifecycle of the asymmetric signing keys and publishes the
//! JWKS document. Exactly one key is active at any time; rotation demotes
//! the prior active key to previous with a grace window during which it
//! still verifies. Rotation runs under optimistic concurrency so multiple
//! instances rotating at once converge on a single winner.

use crate::entity::signing_key;
use crate::error::ServiceError;
use crate::oauth2::jwt;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use jsonwebtoken::{DecodingKey, EncodingKey};
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_FIXED_SIGNING, EcdsaKeyPair};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

/// A single published JSON Web Key. RSA keys carry `n`/`e`, EC keys carry
/// `crv`/`x`/`y`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

struct CachedRing {
    loaded_at: OffsetDateTime,
    active_kid: String,
    encoding_key: EncodingKey,
    keys: Vec<signing_key::Model>,
}

/// The key ring service. Cheap to clone; the cache is shared.
#[derive(Clone)]
pub struct KeyRing {
    db: Arc<DatabaseConnection>,
    grace: Duration,
    cache_ttl: Duration,
    issuer: String,
    clock_skew_secs: u64,
    cache: Arc<RwLock<Option<CachedRing>>>,
}

impl KeyRing {
    pub fn new(
        db: Arc<DatabaseConnection>,
        grace: Duration,
        cache_ttl: Duration,
        issuer: String,
        clock_skew_secs: u64,
    ) -> Self {
        Self {
            db,
            grace,
            cache_ttl,
            issuer,
            clock_skew_secs,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    /// Create the first active key if the ring is empty. Safe to call from
    /// several instances: losers of the insert race just reload.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_initialized(&self) -> Result<(), ServiceError> {
        let existing = signing_key::Entity::find()
            .filter(signing_key::Column::Status.eq(signing_key::STATUS_ACTIVE))
            .one(self.db.as_ref())
            .await?;
        if existing.is_some() {
            return Ok(());
        }
        let kid = self.insert_active_key().await?;
        tracing::info!(kid = %kid, "initialized signing key ring");

        // Several instances may race this first boot. Converge on the
        // earliest key and demote any extras to previous.
        let now = OffsetDateTime::now_utc();
        let mut actives = signing_key::Entity::find()
            .filter(signing_key::Column::Status.eq(signing_key::STATUS_ACTIVE))
            .all(self.db.as_ref())
            .await?;
        actives.sort_by(|a, b| (a.created_at, &a.kid).cmp(&(b.created_at, &b.kid)));
        for extra in actives.iter().skip(1) {
            let _ = signing_key::Entity::update_many()
                .col_expr(
                    signing_key::Column::Status,
                    Expr::value(signing_key::STATUS_PREVIOUS),
                )
                .col_expr(
                    signing_key::Column::RetireAfter,
                    Expr::value(Some(now + self.grace)),
                )
                .filter(signing_key::Column::Kid.eq(&extra.kid))
                .filter(signing_key::Column::Status.eq(signing_key::STATUS_ACTIVE))
                .exec(self.db.as_ref())
                .await?;
        }
        self.invalidate_cache().await;
        Ok(())
    }

    /// Rotate immediately: demote the current active key to previous with a
    /// grace window and install a fresh active key. Returns the new kid.
    /// If a concurrent rotation won the demotion race this is a no-op
    /// returning `ServiceError::Conflict`.
    #[tracing::instrument(skip(self))]
    pub async fn rotate_now(&self) -> Result<String, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let active = signing_key::Entity::find()
            .filter(signing_key::Column::Status.eq(signing_key::STATUS_ACTIVE))
            .one(self.db.as_ref())
            .await?;

        if let Some(active) = active {
            let result = signing_key::Entity::update_many()
                .col_expr(
                    signing_key::Column::Status,
                    Expr::value(signing_key::STATUS_PREVIOUS),
                )
                .col_expr(
                    signing_key::Column::RetireAfter,
                    Expr::value(Some(now + self.grace)),
                )
                .col_expr(
                    signing_key::Column::RowVersion,
                    Expr::value(active.row_version + 1),
                )
                .filter(signing_key::Column::Kid.eq(&active.kid))
                .filter(signing_key::Column::Status.eq(signing_key::STATUS_ACTIVE))
                .filter(signing_key::Column::RowVersion.eq(active.row_version))
                .exec(self.db.as_ref())
                .await?;

            if result.rows_affected == 0 {
                return Err(ServiceError::Conflict);
            }
        }

        let kid = self.insert_active_key().await?;
        self.invalidate_cache().await;
        tracing::info!(kid = %kid, "rotated signing key");
        Ok(kid)
    }

    /// Scheduled rotation: rotate only when the active key has been active
    /// for at least `interval`. Safe to call from several instances on
    /// independent timers; a loser of the demotion race observes the
    /// rotation as already done and reports no new key.
    #[tracing::instrument(skip(self))]
    pub async fn rotate_if_due(&self, interval: Duration) -> Result<Option<String>, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let active = signing_key::Entity::find()
            .filter(signing_key::Column::Status.eq(signing_key::STATUS_ACTIVE))
            .one(self.db.as_ref())
            .await?;
        let Some(active) = active else {
            // No signer at all; treat as overdue.
            return self.rotate_now().await.map(Some);
        };
        let activated = active.activated_at.unwrap_or(active.created_at);
        if now - activated < interval {
            return Ok(None);
        }
        match self.rotate_now().await {
            Ok(kid) => Ok(Some(kid)),
            Err(ServiceError::Conflict) => {
                tracing::debug!("concurrent rotation already completed");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Retire a previous key ahead of its grace window. The active key can
    /// never be retired; rotate first.
    #[tracing::instrument(skip(self))]
    pub async fn retire(&self, kid: &str) -> Result<(), ServiceError> {
        let key = signing_key::Entity::find_by_id(kid)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::UnknownKey(kid.to_string()))?;

        if key.status == signing_key::STATUS_ACTIVE {
            return Err(ServiceError::RetireActiveKey);
        }

        let result = signing_key::Entity::update_many()
            .col_expr(
                signing_key::Column::Status,
                Expr::value(signing_key::STATUS_RETIRED),
            )
            .col_expr(
                signing_key::Column::RowVersion,
                Expr::value(key.row_version + 1),
            )
            .filter(signing_key::Column::Kid.eq(kid))
            .filter(signing_key::Column::RowVersion.eq(key.row_version))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict);
        }

        self.invalidate_cache().await;
        tracing::info!(kid = %kid, "retired signing key");
        Ok(())
    }

    /// Incident response: drop a key from JWKS and fail its signatures
    /// immediately, regardless of state.
    #[tracing::instrument(skip(self))]
    pub async fn revoke(&self, kid: &str) -> Result<(), ServiceError> {
        let key = signing_key::Entity::find_by_id(kid)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::UnknownKey(kid.to_string()))?;

        let result = signing_key::Entity::update_many()
            .col_expr(
                signing_key::Column::Status,
                Expr::value(signing_key::STATUS_REVOKED),
            )
            .col_expr(
                signing_key::Column::RowVersion,
                Expr::value(key.row_version + 1),
            )
            .filter(signing_key::Column::Kid.eq(kid))
            .filter(signing_key::Column::RowVersion.eq(key.row_version))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::Conflict);
        }

        let was_active = key.status == signing_key::STATUS_ACTIVE;
        self.invalidate_cache().await;
        tracing::warn!(kid = %kid, was_active, "revoked signing key");

        // Revoking the active key leaves the ring without a signer; install
        // a replacement so issuance keeps working.
        if was_active {
            self.insert_active_key().await?;
            self.invalidate_cache().await;
        }
        Ok(())
    }

    /// All keys, for the admin listing.
    pub async fn list(&self) -> Result<Vec<signing_key::Model>, ServiceError> {
        Ok(signing_key::Entity::find().all(self.db.as_ref()).await?)
    }

    /// The published JWKS: active and still-in-grace previous keys only.
    pub async fn jwks_document(&self) -> Result<JwksDocument, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let ring = self.load_cached().await?;
        let keys = ring
            .keys
            .iter()
            .filter(|k| k.published_at(now))
            .map(|k| Jwk {
                kty: "EC".to_string(),
                kid: k.kid.clone(),
                key_use: "sig".to_string(),
                alg: k.alg.clone(),
                n: None,
                e: None,
                crv: Some("P-256".to_string()),
                x: Some(k.public_x.clone()),
                y: Some(k.public_y.clone()),
            })
            .collect();
        Ok(JwksDocument { keys })
    }

    /// Sign claims with the active key.
    pub async fn sign<T: Serialize>(&self, claims: &T) -> Result<(String, String), ServiceError> {
        let ring = self.load_cached().await?;
        let jwt = jwt::encode(claims, &ring.active_kid, &ring.encoding_key)?;
        Ok((jwt, ring.active_kid.clone()))
    }

    /// Verify a token signature, resolving `kid` against keys that are
    /// allowed to verify right now. Revoked and retired kids fail even for
    /// otherwise-unexpired signatures.
    pub async fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, ServiceError> {
        let kid = jwt::peek_kid(token)?;
        let now = OffsetDateTime::now_utc();
        let ring = self.load_cached().await?;
        let key = ring
            .keys
            .iter()
            .find(|k| k.kid == kid)
            .ok_or_else(|| ServiceError::UnknownKey(kid.clone()))?;
        if !key.verifies_at(now) {
            return Err(ServiceError::UnknownKey(kid));
        }
        let decoding = DecodingKey::from_ec_components(&key.public_x, &key.public_y)
            .map_err(|e| ServiceError::Crypto(e.to_string()))?;
        jwt::decode(token, &decoding, &self.issuer, self.clock_skew_secs)
    }

    pub async fn invalidate_cache(&self) {
        *self.cache.write().await = None;
    }

    async fn load_cached(&self) -> Result<Arc<LoadedRing>, ServiceError> {
        let now = OffsetDateTime::now_utc();
        {
            let guard = self.cache.read().await;
            if let Some(cached) = guard.as_ref()
                && now - cached.loaded_at < self.cache_ttl
            {
                return Ok(Arc::new(LoadedRing {
                    active_kid: cached.active_kid.clone(),
                    encoding_key: cached.encoding_key.clone(),
                    keys: cached.keys.clone(),
                }));
            }
        }

        let keys = signing_key::Entity::find().all(self.db.as_ref()).await?;
        let active = keys
            .iter()
            .find(|k| k.status == signing_key::STATUS_ACTIVE)
            .ok_or(ServiceError::NoActiveKey)?;
        let der = STANDARD
            .decode(&active.private_pkcs8)
            .map_err(|e| ServiceError::Crypto(e.to_string()))?;
        let encoding_key = EncodingKey::from_ec_der(&der);

        let loaded = LoadedRing {
            active_kid: active.kid.clone(),
            encoding_key: encoding_key.clone(),
            keys: keys.clone(),
        };
        *self.cache.write().await = Some(CachedRing {
            loaded_at: now,
            active_kid: loaded.active_kid.clone(),
            encoding_key,
            keys,
        });
        Ok(Arc::new(loaded))
    }

    async fn insert_active_key(&self) -> Result<String, ServiceError> {
        let now = OffsetDateTime::now_utc();
        let material = generate_p256_key()?;
        let kid = uuid::Uuid::new_v4().to_string();

        let key = signing_key::ActiveModel {
            kid: Set(kid.clone()),
            alg: Set("ES256".to_string()),
            private_pkcs8: Set(material.private_pkcs8_b64),
            public_x: Set(material.public_x),
            public_y: Set(material.public_y),
            status: Set(signing_key::STATUS_ACTIVE.to_string()),
            created_at: Set(now),
            activated_at: Set(Some(now)),
            retire_after: Set(None),
            not_before: Set(now),
            not_after: Set(now + Duration::days(365)),
            row_version: Set(1),
        };
        key.insert(self.db.as_ref()).await?;
        Ok(kid)
    }
}

struct LoadedRing {
    active_kid: String,
    encoding_key: EncodingKey,
    keys: Vec<signing_key::Model>,
}

struct KeyMaterial {
    private_pkcs8_b64: String,
    public_x: String,
    public_y: String,
}

/// Generate a fresh P-256 keypair. The public coordinates come from the
/// uncompressed SEC1 point (0x04 || X || Y) in JWKS base64url form.
fn generate_p256_key() -> Result<KeyMaterial, ServiceError> {
    let rng = SystemRandom::new();
    let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
        .map_err(|_| ServiceError::Crypto("P-256 keypair generation failed".to_string()))?;
    let pair = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, document.as_ref(), &rng)
        .map_err(|_| ServiceError::Crypto("generated key failed to parse".to_string()))?;

    let public = pair.public_key().as_ref();
    if public.len() != 65 || public[0] != 0x04 {
        return Err(ServiceError::Crypto(
            "unexpected public key encoding".to_string(),
        ));
    }

    Ok(KeyMaterial {
        private_pkcs8_b64: STANDARD.encode(document.as_ref()),
        public_x: URL_SAFE_NO_PAD.encode(&public[1..33]),
        public_y: URL_SAFE_NO_PAD.encode(&public[33..65]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_jwks_coordinates() {
        let material = generate_p256_key().unwrap();
        let x = URL_SAFE_NO_PAD.decode(&material.public_x).unwrap();
        let y = URL_SAFE_NO_PAD.decode(&material.public_y).unwrap();
        assert_eq!(x.len(), 32);
        assert_eq!(y.len(), 32);
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = generate_p256_key().unwrap();
        let b = generate_p256_key().unwrap();
        assert_ne!(a.public_x, b.public_x);
    }

    #[test]
    fn jwk_serializes_ec_fields_only() {
        let jwk = Jwk {
            kty: "EC".into(),
            kid: "key-1".into(),
            key_use: "sig".into(),
            alg: "ES256".into(),
            n: None,
            e: None,
            crv: Some("P-256".into()),
            x: Some("x".into()),
            y: Some("y".into()),
        };
        let json = serde_json::to_value(&jwk).unwrap();
        assert_eq!(json["use"], "sig");
        assert_eq!(json["crv"], "P-256");
        assert!(json.get("n").is_none());
    }
}
