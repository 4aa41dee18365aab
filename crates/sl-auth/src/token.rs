// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bearer-token issuing and validation.
//!
//! Tokens have the shape `slt_<user-uuid>_<expiry-unix>_<tag>` where the tag
//! is a keyed SHA-256 over the user id and expiry. Expiry and tag are
//! checked at the edge; everything behind the edge works with the resolved
//! [`UserId`].

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sl_core::UserId;

const TOKEN_PREFIX: &str = "slt";
const TAG_HEX_LEN: usize = 32;

/// Errors from token validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The token does not have the expected shape.
    #[error("malformed token")]
    Malformed,
    /// The signature tag does not verify.
    #[error("token signature mismatch")]
    BadSignature,
    /// The token's expiry is in the past.
    #[error("token expired")]
    Expired,
}

/// Issues and validates bearer tokens with a process-wide secret.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    secret: String,
}

impl TokenValidator {
    /// Create a validator over the configured signing secret.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issue a token for `user` valid for `ttl`.
    #[must_use]
    pub fn issue(&self, user: UserId, ttl: Duration) -> String {
        let expiry = (Utc::now() + ttl).timestamp();
        let tag = self.tag(user, expiry);
        format!("{TOKEN_PREFIX}_{user}_{expiry}_{tag}")
    }

    /// Validate a raw bearer token and resolve the acting user.
    pub fn validate(&self, raw: &str) -> Result<UserId, TokenError> {
        self.validate_at(raw, Utc::now())
    }

    /// Validation against an explicit clock, for tests.
    pub fn validate_at(&self, raw: &str, now: DateTime<Utc>) -> Result<UserId, TokenError> {
        let mut parts = raw.splitn(4, '_');
        let prefix = parts.next().ok_or(TokenError::Malformed)?;
        if prefix != TOKEN_PREFIX {
            return Err(TokenError::Malformed);
        }
        let user: UserId = parts
            .next()
            .ok_or(TokenError::Malformed)?
            .parse()
            .map_err(|_| TokenError::Malformed)?;
        let expiry: i64 = parts
            .next()
            .ok_or(TokenError::Malformed)?
            .parse()
            .map_err(|_| TokenError::Malformed)?;
        let tag = parts.next().ok_or(TokenError::Malformed)?;

        if tag != self.tag(user, expiry) {
            return Err(TokenError::BadSignature);
        }
        if expiry < now.timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(user)
    }

    fn tag(&self, user: UserId, expiry: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"|");
        hasher.update(user.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(expiry.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut tag = String::with_capacity(TAG_HEX_LEN);
        for byte in digest.iter().take(TAG_HEX_LEN / 2) {
            tag.push_str(&format!("{byte:02x}"));
        }
        tag
    }
}
