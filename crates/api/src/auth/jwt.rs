//! JWT token generation and validation
//!
//! Access and refresh tokens are signed with two different secrets, so a
//! leaked access-token key cannot mint refresh tokens and vice versa. Expiry is
//! checked against the caller-supplied `now` rather than the library's own
//! system-time check, keeping one time source for signing and storage.

use bms_shared::Role;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::{AuthConfig, ConfigError};

/// Clock skew tolerance in seconds
const LEEWAY_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Claims carried by access tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject (user ID)
    pub sub: Uuid,
    pub role: Role,
    pub name: String,
    pub email: String,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
    /// JWT ID
    pub jti: String,
    pub token_type: TokenType,
}

/// Claims carried by refresh tokens. Only the subject: everything else is
/// re-read from the directory on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
    /// Makes every refresh token value unique, even within the same second
    pub jti: String,
    pub token_type: TokenType,
}

/// Who an access token is issued for
#[derive(Debug, Clone, Copy)]
pub struct TokenSubject<'a> {
    pub id: Uuid,
    pub role: Role,
    pub name: &'a str,
    pub email: &'a str,
}

/// A freshly signed token
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: OffsetDateTime,
}

/// JWT manager for token operations
#[derive(Clone)]
pub struct JwtManager {
    access_encoding_key: EncodingKey,
    access_decoding_key: DecodingKey,
    refresh_encoding_key: EncodingKey,
    refresh_decoding_key: DecodingKey,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
}

impl JwtManager {
    /// Build the manager from validated auth config. Fails when either secret
    /// is unset or weak, so a misconfigured deployment never starts.
    pub fn new(config: &AuthConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let access = config.access_token_secret.as_bytes();
        let refresh = config.refresh_token_secret.as_bytes();

        Ok(Self {
            access_encoding_key: EncodingKey::from_secret(access),
            access_decoding_key: DecodingKey::from_secret(access),
            refresh_encoding_key: EncodingKey::from_secret(refresh),
            refresh_decoding_key: DecodingKey::from_secret(refresh),
            access_token_ttl: config.access_token_ttl,
            refresh_token_ttl: config.refresh_token_ttl,
        })
    }

    /// Sign an access token for `subject`
    pub fn issue_access_token(
        &self,
        subject: TokenSubject<'_>,
        now: OffsetDateTime,
    ) -> Result<IssuedToken, JwtError> {
        let expires_at = now + self.access_token_ttl;
        let jti = Uuid::new_v4().to_string();

        let claims = AccessClaims {
            sub: subject.id,
            role: subject.role,
            name: subject.name.to_string(),
            email: subject.email.to_string(),
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            jti: jti.clone(),
            token_type: TokenType::Access,
        };

        // Explicit algorithm prevents algorithm confusion attacks
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.access_encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))?;

        Ok(IssuedToken {
            token,
            jti,
            expires_at,
        })
    }

    /// Sign a refresh token for `user_id`
    pub fn issue_refresh_token(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<IssuedToken, JwtError> {
        let expires_at = now + self.refresh_token_ttl;
        let jti = Uuid::new_v4().to_string();

        let claims = RefreshClaims {
            sub: user_id,
            iat: now.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            jti: jti.clone(),
            token_type: TokenType::Refresh,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.refresh_encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))?;

        Ok(IssuedToken {
            token,
            jti,
            expires_at,
        })
    }

    /// Validate an access token
    pub fn verify_access_token(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<AccessClaims, JwtError> {
        let claims: AccessClaims = decode_claims(token, &self.access_decoding_key)?;
        if claims.token_type != TokenType::Access {
            return Err(JwtError::WrongTokenType);
        }
        check_window(claims.iat, claims.exp, now)?;
        Ok(claims)
    }

    /// Validate a refresh token
    pub fn verify_refresh_token(
        &self,
        token: &str,
        now: OffsetDateTime,
    ) -> Result<RefreshClaims, JwtError> {
        let claims: RefreshClaims = decode_claims(token, &self.refresh_decoding_key)?;
        if claims.token_type != TokenType::Refresh {
            return Err(JwtError::WrongTokenType);
        }
        check_window(claims.iat, claims.exp, now)?;
        Ok(claims)
    }

    /// Get access token expiry in seconds
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_ttl.whole_seconds()
    }
}

fn decode_claims<T: serde::de::DeserializeOwned>(
    token: &str,
    key: &DecodingKey,
) -> Result<T, JwtError> {
    let mut validation = Validation::new(Algorithm::HS256);
    // Expiry is checked in `check_window` against the shared clock
    validation.validate_exp = false;

    decode::<T>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!(kind = ?e.kind(), "jwt: token rejected");
            JwtError::Invalid
        })
}

fn check_window(iat: i64, exp: i64, now: OffsetDateTime) -> Result<(), JwtError> {
    let now = now.unix_timestamp();
    if exp <= iat {
        return Err(JwtError::Invalid);
    }
    if iat > now + LEEWAY_SECS {
        return Err(JwtError::Invalid);
    }
    if exp + LEEWAY_SECS <= now {
        return Err(JwtError::Expired);
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Wrong token type")]
    WrongTokenType,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
}
