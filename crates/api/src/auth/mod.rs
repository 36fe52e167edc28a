//! Authentication and token lifecycle

pub mod clock;
pub mod directory;
pub mod error;
pub mod jwt;
pub mod middleware;
pub mod password;
pub mod service;
pub mod store;
pub mod tokens;

pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::{InMemoryUserDirectory, PgUserDirectory, UserDirectory};
pub use error::{AuthError, AuthResult, RepositoryError};
pub use jwt::{AccessClaims, JwtError, JwtManager, RefreshClaims, TokenType};
pub use middleware::{
    require_auth, require_resource_owner, require_roles, AuthState, AuthUser, OwnerLookup,
    RoleGuard,
};
pub use password::{validate_password_strength, PasswordManager};
pub use service::{AuthService, AuthSession, PasswordResetRequested, PublicUser};
pub use store::{InMemoryRefreshTokenStore, NewRefreshToken, PgRefreshTokenStore, RefreshTokenStore};
pub use tokens::PasswordResetTicket;
