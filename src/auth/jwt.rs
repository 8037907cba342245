//! HS256 access tokens.
//!
//! Tokens are compact JWS strings `header.claims.signature`, each segment
//! base64url without padding, signed with HMAC-SHA256 over the first two
//! segments.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config;

type HmacSha256 = Hmac<Sha256>;

const ALG: &str = "HS256";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub user_id: i64,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Clone)]
pub struct JwtManager {
    secret: Vec<u8>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl std::fmt::Debug for JwtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtManager")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl JwtManager {
    pub fn new(secret: impl Into<Vec<u8>>, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn from_config(cfg: &config::Jwt) -> Self {
        Self::new(
            cfg.secret.as_bytes().to_vec(),
            Duration::minutes(cfg.access_token_ttl_minutes as i64),
            Duration::hours(cfg.refresh_token_ttl_hours as i64),
        )
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Sign an access token for `user_id`; returns the token and its expiry.
    pub fn generate_token(&self, user_id: i64) -> Result<(String, DateTime<Utc>), JwtError> {
        self.generate_token_at(user_id, Utc::now())
    }

    fn generate_token_at(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), JwtError> {
        let expires = now + self.access_ttl;
        let header = Header {
            alg: ALG.into(),
            typ: "JWT".into(),
        };
        let claims = Claims {
            user_id,
            iat: now.timestamp(),
            exp: expires.timestamp(),
        };
        let header = serde_json::to_vec(&header).map_err(|e| JwtError::Signing(e.to_string()))?;
        let claims = serde_json::to_vec(&claims).map_err(|e| JwtError::Signing(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(claims)
        );
        let signature = self.sign(signing_input.as_bytes())?;
        Ok((
            format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)),
            expires,
        ))
    }

    /// Verify signature, algorithm and expiry. An expired but otherwise valid
    /// token yields `JwtError::Expired`.
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        self.validate_token_at(token, Utc::now())
    }

    fn validate_token_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, JwtError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(JwtError::Invalid);
        };

        let header: Header = decode_segment(header_b64)?;
        if header.alg != ALG {
            return Err(JwtError::Invalid);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| JwtError::Invalid)?;
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| JwtError::Invalid)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature).map_err(|_| JwtError::Invalid)?;

        let claims: Claims = decode_segment(claims_b64)?;
        if claims.exp <= now.timestamp() {
            return Err(JwtError::Expired);
        }
        Ok(claims)
    }

    fn sign(&self, input: &[u8]) -> Result<Vec<u8>, JwtError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| JwtError::Signing(e.to_string()))?;
        mac.update(input);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T, JwtError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| JwtError::Invalid)?;
    serde_json::from_slice(&bytes).map_err(|_| JwtError::Invalid)
}
