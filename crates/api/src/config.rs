//! Application configuration

use std::env;
use std::str::FromStr;

use time::Duration;

/// Minimum length for HMAC signing secrets
const MIN_SECRET_LEN: usize = 32;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Vec<String>,
    pub log_format: LogFormat,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Authentication
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Everything the auth core reads. Built once at startup and shared by
/// reference with the session service and the middleware.
#[derive(Clone)]
pub struct AuthConfig {
    pub access_token_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_secret: String,
    pub refresh_token_ttl: Duration,
    pub password_reset_ttl: Duration,
    /// Issue a new refresh token on every refresh and revoke the old one
    pub rotate_refresh_tokens: bool,
    /// Re-check the user record on every authenticated request
    pub reverify_user: bool,
    pub argon2: Argon2Config,
    /// Floor for login / forgot-password response times
    pub min_auth_response: std::time::Duration,
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Config {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for Argon2Config {
    fn default() -> Self {
        Self {
            memory_kib: argon2::Params::DEFAULT_M_COST,
            iterations: argon2::Params::DEFAULT_T_COST,
            parallelism: argon2::Params::DEFAULT_P_COST,
        }
    }
}

impl Argon2Config {
    /// Cost parameters from `ARGON2_*` variables, defaulting to the argon2
    /// crate's recommended values
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            memory_kib: parse_var("ARGON2_MEMORY_KIB", defaults.memory_kib)?,
            iterations: parse_var("ARGON2_ITERATIONS", defaults.iterations)?,
            parallelism: parse_var("ARGON2_PARALLELISM", defaults.parallelism)?,
        })
    }
}

impl AuthConfig {
    /// Auth config with default lifetimes and flags for the given secrets.
    pub fn new(access_token_secret: impl Into<String>, refresh_token_secret: impl Into<String>) -> Self {
        Self {
            access_token_secret: access_token_secret.into(),
            access_token_ttl: Duration::hours(1),
            refresh_token_secret: refresh_token_secret.into(),
            refresh_token_ttl: Duration::days(7),
            password_reset_ttl: Duration::hours(1),
            rotate_refresh_tokens: true,
            reverify_user: true,
            argon2: Argon2Config::default(),
            min_auth_response: std::time::Duration::from_millis(500),
        }
    }

    /// Reject secrets that would let one token type be forged from the other
    /// or that are too short for HS256.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token_secret.is_empty() {
            return Err(ConfigError::Missing("JWT_ACCESS_SECRET"));
        }
        if self.refresh_token_secret.is_empty() {
            return Err(ConfigError::Missing("JWT_REFRESH_SECRET"));
        }
        if self.access_token_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::WeakSecret(
                "JWT_ACCESS_SECRET must be at least 32 characters",
            ));
        }
        if self.refresh_token_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::WeakSecret(
                "JWT_REFRESH_SECRET must be at least 32 characters",
            ));
        }
        if self.access_token_secret == self.refresh_token_secret {
            return Err(ConfigError::SharedSecret);
        }
        if self.access_token_ttl <= Duration::ZERO {
            return Err(ConfigError::Invalid("ACCESS_TOKEN_TTL_SECS"));
        }
        if self.refresh_token_ttl <= Duration::ZERO {
            return Err(ConfigError::Invalid("REFRESH_TOKEN_TTL_SECS"));
        }
        if self.password_reset_ttl <= Duration::ZERO {
            return Err(ConfigError::Invalid("PASSWORD_RESET_TTL_SECS"));
        }
        Ok(())
    }
}

// Secrets never reach the logs.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_token_secret", &"[REDACTED]")
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_secret", &"[REDACTED]")
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("password_reset_ttl", &self.password_reset_ttl)
            .field("rotate_refresh_tokens", &self.rotate_refresh_tokens)
            .field("reverify_user", &self.reverify_user)
            .field("argon2", &self.argon2)
            .field("min_auth_response", &self.min_auth_response)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let auth = AuthConfig {
            access_token_secret: env::var("JWT_ACCESS_SECRET")
                .map_err(|_| ConfigError::Missing("JWT_ACCESS_SECRET"))?,
            access_token_ttl: Duration::seconds(parse_var("ACCESS_TOKEN_TTL_SECS", 3600)?),
            refresh_token_secret: env::var("JWT_REFRESH_SECRET")
                .map_err(|_| ConfigError::Missing("JWT_REFRESH_SECRET"))?,
            refresh_token_ttl: Duration::seconds(parse_var("REFRESH_TOKEN_TTL_SECS", 604_800)?),
            password_reset_ttl: Duration::seconds(parse_var("PASSWORD_RESET_TTL_SECS", 3600)?),
            rotate_refresh_tokens: parse_var("REFRESH_TOKEN_ROTATION", true)?,
            reverify_user: parse_var("AUTH_REVERIFY_USER", true)?,
            argon2: Argon2Config::from_env()?,
            min_auth_response: std::time::Duration::from_millis(parse_var(
                "AUTH_MIN_RESPONSE_MS",
                500,
            )?),
        };
        auth.validate()?;

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", 30)?,
            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,

            auth,
        })
    }
}

/// Read an optional variable, falling back to `default` when unset.
/// A value that is set but does not parse is a startup error.
fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Access and refresh tokens must be signed with different secrets")]
    SharedSecret,
    #[error("Invalid Argon2 parameters: {0}")]
    Argon2(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ACCESS: &str = "test-access-secret-must-be-at-least-32-chars";
    const REFRESH: &str = "test-refresh-secret-must-be-at-least-32-chars";

    const OPTIONAL_VARS: &[&str] = &[
        "ACCESS_TOKEN_TTL_SECS",
        "REFRESH_TOKEN_TTL_SECS",
        "PASSWORD_RESET_TTL_SECS",
        "REFRESH_TOKEN_ROTATION",
        "AUTH_REVERIFY_USER",
        "ARGON2_MEMORY_KIB",
        "ARGON2_ITERATIONS",
        "ARGON2_PARALLELISM",
        "AUTH_MIN_RESPONSE_MS",
        "BIND_ADDRESS",
        "REQUEST_TIMEOUT_SECS",
        "CORS_ALLOWED_ORIGINS",
        "LOG_FORMAT",
        "DATABASE_MAX_CONNECTIONS",
    ];

    /// Helper to set required env vars for testing
    fn setup_minimal_config() {
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("JWT_ACCESS_SECRET", ACCESS);
        env::set_var("JWT_REFRESH_SECRET", REFRESH);
    }

    /// Helper to clear env vars after tests
    fn cleanup_config() {
        env::remove_var("DATABASE_URL");
        env::remove_var("JWT_ACCESS_SECRET");
        env::remove_var("JWT_REFRESH_SECRET");
        for var in OPTIONAL_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        setup_minimal_config();

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.auth.access_token_ttl, Duration::hours(1));
        assert_eq!(config.auth.refresh_token_ttl, Duration::days(7));
        assert_eq!(config.auth.password_reset_ttl, Duration::hours(1));
        assert!(config.auth.rotate_refresh_tokens);
        assert!(config.auth.reverify_user);
        assert_eq!(config.auth.argon2, Argon2Config::default());
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.cors_allowed_origins.is_empty());

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_overrides() {
        setup_minimal_config();
        env::set_var("ACCESS_TOKEN_TTL_SECS", "900");
        env::set_var("REFRESH_TOKEN_ROTATION", "false");
        env::set_var("AUTH_REVERIFY_USER", "false");
        env::set_var("CORS_ALLOWED_ORIGINS", "https://a.example, https://b.example");
        env::set_var("LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();
        assert_eq!(config.auth.access_token_ttl, Duration::minutes(15));
        assert!(!config.auth.rotate_refresh_tokens);
        assert!(!config.auth.reverify_user);
        assert_eq!(
            config.cors_allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(config.log_format, LogFormat::Json);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_secret_validation() {
        // === Missing refresh secret ===
        setup_minimal_config();
        env::remove_var("JWT_REFRESH_SECRET");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("JWT_REFRESH_SECRET"))
        ));

        // === Short access secret ===
        setup_minimal_config();
        env::set_var("JWT_ACCESS_SECRET", "short");
        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        // === Same secret for both token types ===
        setup_minimal_config();
        env::set_var("JWT_REFRESH_SECRET", ACCESS);
        assert!(matches!(Config::from_env(), Err(ConfigError::SharedSecret)));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_unparseable_value_is_rejected() {
        setup_minimal_config();
        env::set_var("REFRESH_TOKEN_TTL_SECS", "seven days");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("REFRESH_TOKEN_TTL_SECS"))
        ));

        cleanup_config();
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = AuthConfig::new(ACCESS, REFRESH);
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains(ACCESS));
        assert!(!rendered.contains(REFRESH));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = AuthConfig::new(ACCESS, REFRESH);
        config.access_token_ttl = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid("ACCESS_TOKEN_TTL_SECS"))
        ));
    }
}
