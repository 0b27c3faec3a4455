//! User directory - the authentication oracle behind the protocol core.
//!
//! The engine only ever asks two questions: who is this subject (and are
//! they usable), and does this password match. Password hashes are Argon2id
//! PHC strings.

use crate::entity::user;
use crate::error::ServiceError;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use time::OffsetDateTime;

/// Hash a password using Argon2id, returning the PHC-formatted string.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

#[derive(Clone)]
pub struct UserDirectory {
    db: Arc<DatabaseConnection>,
}

impl UserDirectory {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_by_subject(&self, id: &str) -> Result<Option<user::Model>, ServiceError> {
        Ok(user::Entity::find_by_id(id).one(self.db.as_ref()).await?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_by_email(&self, email: &str) -> Result<Option<user::Model>, ServiceError> {
        Ok(user::Entity::find()
            .filter(user::Column::Email.eq(email))
            .one(self.db.as_ref())
            .await?)
    }

    /// Authenticate with email + password. Returns the user only when the
    /// account is usable and the password verifies; every other case is an
    /// indistinguishable `None` to the caller.
    #[tracing::instrument(skip(self, password))]
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<user::Model>, ServiceError> {
        let Some(found) = self.find_by_email(email).await? else {
            return Ok(None);
        };
        if !found.is_usable() {
            tracing::debug!(user_id = %found.id, "authentication attempt for unusable account");
            return Ok(None);
        }
        let Some(hash) = found.password_hash.as_deref() else {
            return Ok(None);
        };
        if verify_password(password, hash) {
            Ok(Some(found))
        } else {
            Ok(None)
        }
    }

    /// Update the subject's last-login timestamp.
    #[tracing::instrument(skip(self))]
    pub async fn record_login(&self, user_id: &str) -> Result<(), ServiceError> {
        if let Some(found) = user::Entity::find_by_id(user_id)
            .one(self.db.as_ref())
            .await?
        {
            let mut active: user::ActiveModel = found.into();
            active.last_login_at = Set(Some(OffsetDateTime::now_utc()));
            active.update(self.db.as_ref()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let password = "my-secure-password-123!";
        let hash = hash_password(password).expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(password, &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn verify_tolerates_malformed_hashes() {
        assert!(!verify_password("password", "not-a-valid-hash"));
        assert!(!verify_password("password", ""));
    }
}
