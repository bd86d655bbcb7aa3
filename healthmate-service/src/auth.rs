//! Bearer-token authentication.
//!
//! Tokens are opaque random strings held server-side with an expiry, so
//! logout is a plain revocation. Passwords are stored as
//! `salt$digest` with a SHA-256 digest over salt bytes + password.

use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::models::User;
use crate::service::{ApiError, AppState, internal_error, unauthorized};

const SALT_LEN: usize = 16;
const TOKEN_LEN: usize = 32;

pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    format!("{}${}", hex::encode(salt), digest_hex(&salt, password))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, digest)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    digest_hex(&salt, password) == digest
}

fn digest_hex(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct TokenRecord {
    user_id: String,
    expires_at: DateTime<Utc>,
}

/// Server-side registry of issued bearer tokens.
pub struct TokenStore {
    tokens: DashMap<String, TokenRecord>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tokens: DashMap::new(),
            ttl,
        }
    }

    /// Mint a fresh token for the user.
    pub fn issue(&self, user_id: &str) -> String {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.tokens.insert(
            token.clone(),
            TokenRecord {
                user_id: user_id.to_string(),
                expires_at: Utc::now()
                    + chrono::Duration::from_std(self.ttl)
                        .unwrap_or_else(|_| chrono::Duration::days(7)),
            },
        );
        token
    }

    /// Resolve a presented token to its user id. Expired tokens are
    /// dropped on the spot.
    pub fn resolve(&self, token: &str) -> Option<String> {
        let record = self.tokens.get(token)?;
        if record.expires_at < Utc::now() {
            drop(record);
            self.tokens.remove(token);
            return None;
        }
        Some(record.user_id.clone())
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }
}

/// The authenticated principal, extracted from the `Authorization` header.
pub struct AuthUser {
    pub user: User,
    pub token: String,
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("Authentication required"))?;

        let user_id = state
            .tokens
            .resolve(token)
            .ok_or_else(|| unauthorized("Invalid or expired token"))?;

        let user = state
            .users
            .get(&user_id)
            .await
            .map_err(|e| {
                error!("Failed to load authenticated user {}: {}", user_id, e);
                internal_error("Server error during authentication")
            })?
            .ok_or_else(|| unauthorized("Invalid or expired token"))?;

        Ok(AuthUser {
            user,
            token: token.to_string(),
        })
    }
}
