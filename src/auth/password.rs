//! Password policy and Argon2 hashing.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use thiserror::Error;

use crate::config;

const MAX_PASSWORD_BYTES: usize = 72;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PasswordError {
    #[error("password is too short")]
    TooShort,
    #[error("password is too long")]
    TooLong,
    #[error("password too weak")]
    TooWeak,
    #[error("password hash failed: {0}")]
    Hash(String),
}

#[derive(Debug, Clone)]
pub struct PasswordManager {
    policy: config::Password,
}

impl PasswordManager {
    pub fn new(policy: config::Password) -> Self {
        Self { policy }
    }

    pub fn validate_strength(&self, password: &str) -> Result<(), PasswordError> {
        if password.chars().count() < self.policy.min_length {
            return Err(PasswordError::TooShort);
        }
        if password.len() > MAX_PASSWORD_BYTES {
            return Err(PasswordError::TooLong);
        }

        let has_upper = password.chars().any(char::is_uppercase);
        let has_lower = password.chars().any(char::is_lowercase);
        let has_digit = password.chars().any(|c| c.is_ascii_digit());
        let has_symbol = password
            .chars()
            .any(|c| !c.is_alphanumeric() && !c.is_whitespace());

        if (self.policy.must_shift_case && !(has_upper && has_lower))
            || (self.policy.must_have_digits && !has_digit)
            || (self.policy.must_have_symbols && !has_symbol)
        {
            return Err(PasswordError::TooWeak);
        }
        Ok(())
    }

    /// Validate and hash on the blocking pool; Argon2 is deliberately slow.
    pub async fn hash_password(&self, password: &str) -> Result<String, PasswordError> {
        self.validate_strength(password)?;
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::default()
                .hash_password(password.as_bytes(), &salt)
                .map(|h| h.to_string())
                .map_err(|e| PasswordError::Hash(e.to_string()))
        })
        .await
        .map_err(|e| PasswordError::Hash(e.to_string()))?
    }

    pub async fn check_password(&self, password: &str, hash: &str) -> bool {
        let password = password.to_owned();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || {
            PasswordHash::new(&hash)
                .map(|parsed| {
                    Argon2::default()
                        .verify_password(password.as_bytes(), &parsed)
                        .is_ok()
                })
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }
}
