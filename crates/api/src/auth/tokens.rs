//! Password reset tokens
//!
//! The plaintext token goes to the user; only its SHA-256 hash is stored, so
//! a read of the users table does not yield usable reset links.

use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Reset ticket as stored on the user record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordResetTicket {
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: OffsetDateTime,
}

impl PasswordResetTicket {
    /// Generate a fresh ticket. Returns the plaintext token alongside the
    /// ticket to persist.
    pub fn issue(user_id: Uuid, now: OffsetDateTime, ttl: Duration) -> (String, Self) {
        let raw_token = generate_token();
        let ticket = Self {
            user_id,
            token_hash: hash_token(&raw_token),
            expires_at: now + ttl,
        };
        (raw_token, ticket)
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }
}

/// Generate a secure random token
///
/// Returns a 32-byte hex-encoded token (64 characters)
pub fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

/// Hash a token using SHA-256
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
