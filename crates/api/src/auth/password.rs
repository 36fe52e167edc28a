//! Password hashing with Argon2id

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use crate::config::Argon2Config;

/// Hashes and verifies account passwords with configurable Argon2id cost
#[derive(Clone)]
pub struct PasswordManager {
    argon2: Argon2<'static>,
    /// Hash of a throwaway password, verified against when the account does
    /// not exist so the miss costs the same as a wrong password.
    dummy_hash: String,
}

impl PasswordManager {
    pub fn new(config: &Argon2Config) -> Result<Self, PasswordError> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| PasswordError::InvalidParams(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let dummy_salt = SaltString::generate(&mut OsRng);
        let dummy_hash = argon2
            .hash_password(b"dummy-password-never-matches", &dummy_salt)
            .map_err(|e| PasswordError::Hashing(e.to_string()))?
            .to_string();

        Ok(Self { argon2, dummy_hash })
    }

    /// Hash a password with a fresh random salt
    pub fn hash(&self, password: &str) -> Result<String, PasswordError> {
        let salt = SaltString::generate(&mut OsRng);

        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| PasswordError::Hashing(e.to_string()))
    }

    /// Verify a password against a stored hash. The cost parameters embedded
    /// in the hash are used, so hashes made under an older config still verify.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool, PasswordError> {
        let parsed_hash =
            PasswordHash::new(hash).map_err(|e| PasswordError::InvalidHash(e.to_string()))?;

        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }

    /// Burn the same CPU as a real verification; the result is discarded.
    pub fn dummy_verify(&self, password: &str) {
        let _ = self.verify(password, &self.dummy_hash);
    }
}

/// Validate password strength for new passwords
pub fn validate_password_strength(password: &str) -> Result<(), PasswordValidationError> {
    let length = password.chars().count();
    if length < 12 {
        return Err(PasswordValidationError::TooShort);
    }

    if length > 128 {
        return Err(PasswordValidationError::TooLong);
    }

    let has_lowercase = password.chars().any(|c| c.is_ascii_lowercase());
    let has_uppercase = password.chars().any(|c| c.is_ascii_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password
        .chars()
        .any(|c| "!@#$%^&*()_+-=[]{}|;:,.<>?/~`".contains(c));

    if !has_lowercase {
        return Err(PasswordValidationError::MissingLowercase);
    }

    if !has_uppercase {
        return Err(PasswordValidationError::MissingUppercase);
    }

    if !has_digit {
        return Err(PasswordValidationError::MissingDigit);
    }

    if !has_special {
        return Err(PasswordValidationError::MissingSpecialChar);
    }

    if is_common_password(password) {
        return Err(PasswordValidationError::TooCommon);
    }

    Ok(())
}

/// Case-insensitive match against passwords that pass the character rules
/// but appear in every breach list.
fn is_common_password(password: &str) -> bool {
    const COMMON_PASSWORDS: &[&str] = &[
        "password123!",
        "password1234!",
        "password@123",
        "password#123",
        "p@ssword1234",
        "p@ssw0rd1234",
        "welcome@1234",
        "welcome123!!",
        "qwerty@12345",
        "qwerty123456!",
        "admin@123456",
        "administrator1!",
        "changeme123!",
        "letmein12345!",
        "iloveyou123!",
        "monkey123456!",
        "sunshine123!",
        "football123!",
        "superman123!",
        "trustno1234!",
    ];

    let password_lower = password.to_lowercase();
    COMMON_PASSWORDS.contains(&password_lower.as_str())
}

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("Password hashing failed: {0}")]
    Hashing(String),
    #[error("Invalid password hash: {0}")]
    InvalidHash(String),
    #[error("Invalid Argon2 parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PasswordValidationError {
    #[error("Password must be at least 12 characters")]
    TooShort,
    #[error("Password must be at most 128 characters")]
    TooLong,
    #[error("Password must contain at least one lowercase letter")]
    MissingLowercase,
    #[error("Password must contain at least one uppercase letter")]
    MissingUppercase,
    #[error("Password must contain at least one digit")]
    MissingDigit,
    #[error("Password must contain at least one special character (!@#$%^&*)")]
    MissingSpecialChar,
    #[error("This password is too common - please choose a unique password")]
    TooCommon,
}
