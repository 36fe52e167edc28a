//! Session lifecycle: login, refresh, logout and password reset
//!
//! `AuthService` owns the token codec and password hasher and talks to the
//! user directory and refresh-token store only through their traits, so the
//! same flows run against PostgreSQL in production and in-memory stores in
//! tests.

use std::sync::Arc;

use bms_shared::{Role, User};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::clock::Clock;
use super::directory::UserDirectory;
use super::error::{AuthError, AuthResult, RepositoryError};
use super::jwt::{JwtManager, TokenSubject};
use super::password::{validate_password_strength, PasswordManager};
use super::store::{NewRefreshToken, RefreshTokenStore};
use super::tokens::{hash_token, PasswordResetTicket};
use crate::audit_constants::{auth_event, reason, AUDIT_TARGET};
use crate::config::{AuthConfig, ConfigError};

/// Returned by `request_password_reset` whether or not the email exists
pub const PASSWORD_RESET_MESSAGE: &str =
    "If an account exists with that email, a password reset link has been sent";

/// The user fields exposed to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            role: user.role,
        }
    }
}

/// Result of a successful login or refresh
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    #[serde(flatten)]
    pub user: PublicUser,
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub token_type: &'static str,
}

/// Outcome of a reset request. `token` is the raw reset token for the
/// delivery channel; it is `None` when no reset was issued and must never be
/// echoed to the requester.
#[derive(Debug, Clone)]
pub struct PasswordResetRequested {
    pub message: &'static str,
    pub token: Option<String>,
}

pub struct AuthService {
    config: Arc<AuthConfig>,
    jwt: JwtManager,
    passwords: PasswordManager,
    users: Arc<dyn UserDirectory>,
    tokens: Arc<dyn RefreshTokenStore>,
    clock: Arc<dyn Clock>,
}

impl AuthService {
    pub fn new(
        config: Arc<AuthConfig>,
        users: Arc<dyn UserDirectory>,
        tokens: Arc<dyn RefreshTokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let jwt = JwtManager::new(&config)?;
        let passwords =
            PasswordManager::new(&config.argon2).map_err(|e| ConfigError::Argon2(e.to_string()))?;

        Ok(Self {
            config,
            jwt,
            passwords,
            users,
            tokens,
            clock,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn jwt(&self) -> &JwtManager {
        &self.jwt
    }

    pub fn passwords(&self) -> &PasswordManager {
        &self.passwords
    }

    pub fn users(&self) -> &Arc<dyn UserDirectory> {
        &self.users
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Exchange email and password for a session.
    ///
    /// Unknown email and wrong password both fail with `InvalidCredentials`,
    /// and the unknown-email path still runs a full hash verification.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client_ip: Option<&str>,
    ) -> AuthResult<AuthSession> {
        let email = normalize_email(email);

        let Some(user) = self.users.find_by_email(&email).await? else {
            self.passwords.dummy_verify(password);
            tracing::warn!(
                target: AUDIT_TARGET,
                event = auth_event::LOGIN_FAILED,
                reason = reason::USER_NOT_FOUND,
                ip = client_ip.unwrap_or("unknown"),
                "login: User not found"
            );
            return Err(AuthError::InvalidCredentials);
        };

        if !user.status.is_active() {
            // Keep the inactive path as slow as a real check
            self.passwords.dummy_verify(password);
            tracing::warn!(
                target: AUDIT_TARGET,
                event = auth_event::LOGIN_FAILED,
                reason = reason::ACCOUNT_INACTIVE,
                user_id = %user.id,
                status = %user.status,
                "login: Account not active"
            );
            return Err(AuthError::AccountInactive);
        }

        let valid = self.passwords.verify(password, &user.password_hash).map_err(|e| {
            tracing::error!(user_id = %user.id, error = %e, "login: Stored password hash is unreadable");
            e
        })?;
        if !valid {
            tracing::warn!(
                target: AUDIT_TARGET,
                event = auth_event::LOGIN_FAILED,
                reason = reason::INVALID_PASSWORD,
                user_id = %user.id,
                "login: Invalid password"
            );
            return Err(AuthError::InvalidCredentials);
        }

        let session = self.start_session(&user, client_ip).await?;
        tracing::info!(
            target: AUDIT_TARGET,
            event = auth_event::LOGIN_SUCCESS,
            user_id = %user.id,
            role = %user.role,
            "login: Login successful"
        );
        Ok(session)
    }

    /// Exchange a refresh token for a new session.
    ///
    /// With rotation on, the presented token is revoked and replaced
    /// atomically; of two concurrent refreshes with the same token exactly one
    /// succeeds. With rotation off the same refresh token is handed back.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        client_ip: Option<&str>,
    ) -> AuthResult<AuthSession> {
        let now = self.clock.now();
        let claims = self.jwt.verify_refresh_token(refresh_token, now)?;

        let Some(record) = self.tokens.find_active_by_token(refresh_token).await? else {
            if let Some(stale) = self.tokens.find_by_token(refresh_token).await? {
                tracing::warn!(
                    target: AUDIT_TARGET,
                    event = auth_event::REFRESH_TOKEN_REUSE,
                    user_id = %stale.user_id,
                    rotated = stale.replaced_by_token.is_some(),
                    ip = client_ip.unwrap_or("unknown"),
                    "refresh: Revoked refresh token presented"
                );
            }
            return Err(AuthError::InvalidToken);
        };

        if record.user_id != claims.sub {
            tracing::warn!(
                target: AUDIT_TARGET,
                event = auth_event::REFRESH_TOKEN_REUSE,
                reason = reason::SUBJECT_MISMATCH,
                record_user_id = %record.user_id,
                claims_user_id = %claims.sub,
                "refresh: Token subject does not match stored record"
            );
            return Err(AuthError::InvalidToken);
        }

        if record.is_expired(now) {
            return Err(AuthError::TokenExpired);
        }

        let user = self
            .users
            .find_by_id(claims.sub)
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if !user.status.is_active() {
            tracing::warn!(user_id = %user.id, status = %user.status, "refresh: Account not active");
            return Err(AuthError::AccountInactive);
        }

        let access = self.jwt.issue_access_token(subject_of(&user), now)?;

        let refresh_token = if self.config.rotate_refresh_tokens {
            let next = self.jwt.issue_refresh_token(user.id, now)?;
            let replacement = NewRefreshToken {
                user_id: user.id,
                token: next.token,
                issued_at: now,
                expires_at: next.expires_at,
                created_by_ip: client_ip.map(str::to_string),
            };
            match self.tokens.rotate(refresh_token, replacement, client_ip).await {
                Ok(successor) => successor.token,
                Err(RepositoryError::AlreadyRevoked) => {
                    tracing::warn!(
                        target: AUDIT_TARGET,
                        event = auth_event::REFRESH_TOKEN_REUSE,
                        reason = reason::CONCURRENT_ROTATION,
                        user_id = %user.id,
                        "refresh: Lost rotation race"
                    );
                    return Err(AuthError::InvalidToken);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            refresh_token.to_string()
        };

        tracing::info!(
            target: AUDIT_TARGET,
            event = auth_event::TOKEN_REFRESHED,
            user_id = %user.id,
            rotated = self.config.rotate_refresh_tokens,
            "refresh: Tokens issued"
        );

        Ok(AuthSession {
            user: PublicUser::from(&user),
            access_token: access.token,
            refresh_token,
            expires_in: self.jwt.access_token_expiry_seconds(),
            token_type: "Bearer",
        })
    }

    /// Revoke every active refresh token of `user_id`. Returns how many were
    /// revoked; calling it again returns 0.
    pub async fn logout(&self, user_id: Uuid, client_ip: Option<&str>) -> AuthResult<u64> {
        let revoked = self
            .tokens
            .revoke_all_for_user(user_id, client_ip, self.clock.now())
            .await?;

        tracing::info!(
            target: AUDIT_TARGET,
            event = auth_event::LOGOUT,
            user_id = %user_id,
            revoked,
            "logout: Refresh tokens revoked"
        );
        Ok(revoked)
    }

    /// Issue a reset ticket for an active account. The outcome never reveals
    /// whether the email is registered.
    pub async fn request_password_reset(&self, email: &str) -> AuthResult<PasswordResetRequested> {
        let email = normalize_email(email);
        let now = self.clock.now();

        let token = match self.users.find_by_email(&email).await? {
            Some(user) if user.status.is_active() => {
                let (raw, ticket) =
                    PasswordResetTicket::issue(user.id, now, self.config.password_reset_ttl);
                self.users.set_reset_ticket(&ticket).await?;
                tracing::info!(
                    target: AUDIT_TARGET,
                    event = auth_event::PASSWORD_RESET_REQUESTED,
                    user_id = %user.id,
                    expires_at = %ticket.expires_at,
                    "forgot_password: Reset ticket issued"
                );
                Some(raw)
            }
            Some(user) => {
                tracing::info!(user_id = %user.id, "forgot_password: Account not active, no ticket issued");
                None
            }
            None => {
                tracing::debug!("forgot_password: No account for email");
                None
            }
        };

        Ok(PasswordResetRequested {
            message: PASSWORD_RESET_MESSAGE,
            token,
        })
    }

    /// Set a new password using a reset ticket. Consumes the ticket and
    /// revokes all of the user's refresh tokens.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
        client_ip: Option<&str>,
    ) -> AuthResult<()> {
        validate_password_strength(new_password)?;
        let now = self.clock.now();

        let ticket = self
            .users
            .find_reset_ticket(&hash_token(token))
            .await?
            .filter(|t| !t.is_expired(now))
            .ok_or(AuthError::InvalidOrExpiredResetToken)?;

        let user = self
            .users
            .find_by_id(ticket.user_id)
            .await?
            .filter(|u| u.status.is_active())
            .ok_or(AuthError::InvalidOrExpiredResetToken)?;

        let password_hash = self.passwords.hash(new_password)?;

        // Only the caller that clears the ticket may write the password
        let consumed = self
            .users
            .consume_reset_ticket(&ticket.token_hash, now)
            .await?;
        if consumed != Some(user.id) {
            tracing::warn!(
                target: AUDIT_TARGET,
                event = auth_event::PASSWORD_RESET_COMPLETED,
                reason = reason::TICKET_ALREADY_USED,
                user_id = %user.id,
                "reset_password: Ticket consumed by a concurrent request"
            );
            return Err(AuthError::InvalidOrExpiredResetToken);
        }

        self.users
            .update_password_hash(user.id, &password_hash, now)
            .await?;
        let revoked = self
            .tokens
            .revoke_all_for_user(user.id, client_ip, now)
            .await?;

        tracing::info!(
            target: AUDIT_TARGET,
            event = auth_event::PASSWORD_RESET_COMPLETED,
            user_id = %user.id,
            revoked,
            "reset_password: Password updated"
        );
        Ok(())
    }

    /// Change the password of a signed-in user. Every refresh token is
    /// revoked, so other devices have to log in again.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
        client_ip: Option<&str>,
    ) -> AuthResult<u64> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::Unauthorized)?;

        if !self.passwords.verify(current_password, &user.password_hash)? {
            tracing::warn!(user_id = %user.id, "change_password: Current password mismatch");
            return Err(AuthError::InvalidCredentials);
        }
        validate_password_strength(new_password)?;

        let now = self.clock.now();
        let password_hash = self.passwords.hash(new_password)?;
        self.users
            .update_password_hash(user.id, &password_hash, now)
            .await?;
        let revoked = self
            .tokens
            .revoke_all_for_user(user.id, client_ip, now)
            .await?;

        tracing::info!(
            target: AUDIT_TARGET,
            event = auth_event::PASSWORD_CHANGED,
            user_id = %user.id,
            revoked,
            "change_password: Password updated"
        );
        Ok(revoked)
    }

    /// The current directory record of an authenticated user
    pub async fn current_user(&self, user_id: Uuid) -> AuthResult<PublicUser> {
        self.users
            .find_by_id(user_id)
            .await?
            .map(|u| PublicUser::from(&u))
            .ok_or(AuthError::Unauthorized)
    }

    async fn start_session(&self, user: &User, client_ip: Option<&str>) -> AuthResult<AuthSession> {
        let now = self.clock.now();
        let access = self.jwt.issue_access_token(subject_of(user), now)?;
        let refresh = self.jwt.issue_refresh_token(user.id, now)?;

        self.tokens
            .create(NewRefreshToken {
                user_id: user.id,
                token: refresh.token.clone(),
                issued_at: now,
                expires_at: refresh.expires_at,
                created_by_ip: client_ip.map(str::to_string),
            })
            .await?;

        Ok(AuthSession {
            user: PublicUser::from(user),
            access_token: access.token,
            refresh_token: refresh.token,
            expires_in: self.jwt.access_token_expiry_seconds(),
            token_type: "Bearer",
        })
    }
}

fn subject_of(user: &User) -> TokenSubject<'_> {
    TokenSubject {
        id: user.id,
        role: user.role,
        name: &user.name,
        email: &user.email,
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::auth::directory::InMemoryUserDirectory;
    use bms_shared::UserStatus;
    use time::Duration;

    const PASSWORD: &str = "Secret123!";
    const NEW_PASSWORD: &str = "N3w-Passw0rd!x";

    #[tokio::test]
    async fn test_login_issues_session() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Admin, UserStatus::Active);

        let session = h.service.login("a@x.com", PASSWORD, Some("10.0.0.1")).await.unwrap();

        assert_eq!(session.user.id, user.id);
        assert_eq!(session.user.role, Role::Admin);
        assert_eq!(session.expires_in, 3600);
        assert_eq!(session.token_type, "Bearer");
        let claims = h
            .service
            .jwt()
            .verify_access_token(&session.access_token, h.clock.now())
            .unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.role, Role::Admin);

        let stored = h.tokens.records_for_user(user.id);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].token, session.refresh_token);
        assert_eq!(stored[0].created_by_ip.as_deref(), Some("10.0.0.1"));
        assert!(!stored[0].revoked);
    }

    #[tokio::test]
    async fn test_login_email_is_case_insensitive() {
        let h = harness();
        h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        assert!(h.service.login("  A@X.com ", PASSWORD, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_email_and_wrong_password_are_indistinguishable() {
        let h = harness();
        h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);

        let unknown = h.service.login("nobody@x.com", PASSWORD, None).await.unwrap_err();
        let wrong = h.service.login("a@x.com", "Wrong123!", None).await.unwrap_err();

        assert!(matches!(unknown, AuthError::InvalidCredentials));
        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert!(h.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_account_cannot_log_in() {
        let h = harness();
        h.add_user("s@x.com", PASSWORD, Role::Employee, UserStatus::Suspended);
        h.add_user("i@x.com", PASSWORD, Role::Employee, UserStatus::Inactive);

        for email in ["s@x.com", "i@x.com"] {
            let err = h.service.login(email, PASSWORD, None).await.unwrap_err();
            assert!(matches!(err, AuthError::AccountInactive));
        }
        assert!(h.tokens.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_rotates_token() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Manager, UserStatus::Active);
        let first = h.service.login("a@x.com", PASSWORD, None).await.unwrap();

        h.clock.advance(Duration::minutes(5));
        let second = h
            .service
            .refresh(&first.refresh_token, Some("10.0.0.2"))
            .await
            .unwrap();

        assert_ne!(second.refresh_token, first.refresh_token);
        assert_ne!(second.access_token, first.access_token);
        assert_eq!(second.user.id, user.id);

        let records = h.tokens.records_for_user(user.id);
        let old = records
            .iter()
            .find(|r| r.token == first.refresh_token)
            .unwrap();
        assert!(old.revoked);
        assert_eq!(old.replaced_by_token.as_deref(), Some(second.refresh_token.as_str()));
        assert_eq!(old.revoked_by_ip.as_deref(), Some("10.0.0.2"));

        // The rotated-out token is dead; the successor works
        assert!(matches!(
            h.service.refresh(&first.refresh_token, None).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(h.service.refresh(&second.refresh_token, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_refresh_has_single_winner() {
        let h = harness();
        h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let session = h.service.login("a@x.com", PASSWORD, None).await.unwrap();

        let (a, b) = tokio::join!(
            h.service.refresh(&session.refresh_token, None),
            h.service.refresh(&session.refresh_token, None)
        );

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_refresh_after_expiry_leaves_store_untouched() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let session = h.service.login("a@x.com", PASSWORD, None).await.unwrap();
        let before = h.tokens.records_for_user(user.id);

        h.clock.advance(Duration::days(8));
        let err = h.service.refresh(&session.refresh_token, None).await.unwrap_err();

        assert!(matches!(err, AuthError::TokenExpired));
        let after = h.tokens.records_for_user(user.id);
        assert_eq!(before.len(), after.len());
        assert!(!after[0].revoked);
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_returns_same_token() {
        let mut config = test_config();
        config.rotate_refresh_tokens = false;
        let h = harness_with(config);
        let user = h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let session = h.service.login("a@x.com", PASSWORD, None).await.unwrap();

        let refreshed = h.service.refresh(&session.refresh_token, None).await.unwrap();
        let again = h.service.refresh(&session.refresh_token, None).await.unwrap();

        assert_eq!(refreshed.refresh_token, session.refresh_token);
        assert_eq!(again.refresh_token, session.refresh_token);
        assert_eq!(h.tokens.records_for_user(user.id).len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejects_access_token_and_garbage() {
        let h = harness();
        h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let session = h.service.login("a@x.com", PASSWORD, None).await.unwrap();

        assert!(matches!(
            h.service.refresh(&session.access_token, None).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            h.service.refresh("not-a-jwt", None).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_refresh_for_signed_but_unstored_token_fails() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let forged = h
            .service
            .jwt()
            .issue_refresh_token(user.id, h.clock.now())
            .unwrap();

        assert!(matches!(
            h.service.refresh(&forged.token, None).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_refresh_for_suspended_or_deleted_user() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let session = h.service.login("a@x.com", PASSWORD, None).await.unwrap();

        h.users.update(user.id, |u| u.status = UserStatus::Suspended);
        assert!(matches!(
            h.service.refresh(&session.refresh_token, None).await,
            Err(AuthError::AccountInactive)
        ));

        let other = h.add_user("b@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let session = h.service.login("b@x.com", PASSWORD, None).await.unwrap();
        h.users.remove(other.id);
        assert!(matches!(
            h.service.refresh(&session.refresh_token, None).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_refresh_picks_up_role_change() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let session = h.service.login("a@x.com", PASSWORD, None).await.unwrap();

        h.users.update(user.id, |u| u.role = Role::Manager);
        let refreshed = h.service.refresh(&session.refresh_token, None).await.unwrap();

        assert_eq!(refreshed.user.role, Role::Manager);
        let claims = h
            .service
            .jwt()
            .verify_access_token(&refreshed.access_token, h.clock.now())
            .unwrap();
        assert_eq!(claims.role, Role::Manager);
    }

    #[tokio::test]
    async fn test_logout_revokes_all_sessions() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let laptop = h.service.login("a@x.com", PASSWORD, None).await.unwrap();
        let phone = h.service.login("a@x.com", PASSWORD, None).await.unwrap();

        assert_eq!(h.service.logout(user.id, Some("10.0.0.3")).await.unwrap(), 2);
        assert_eq!(h.service.logout(user.id, None).await.unwrap(), 0);

        for token in [laptop.refresh_token, phone.refresh_token] {
            assert!(matches!(
                h.service.refresh(&token, None).await,
                Err(AuthError::InvalidToken)
            ));
        }
    }

    #[tokio::test]
    async fn test_password_reset_response_does_not_leak_existence() {
        let h = harness();
        h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        h.add_user("s@x.com", PASSWORD, Role::Employee, UserStatus::Suspended);

        let known = h.service.request_password_reset("a@x.com").await.unwrap();
        let unknown = h.service.request_password_reset("nobody@x.com").await.unwrap();
        let suspended = h.service.request_password_reset("s@x.com").await.unwrap();

        assert_eq!(known.message, unknown.message);
        assert_eq!(known.message, suspended.message);
        assert!(known.token.is_some());
        assert!(unknown.token.is_none());
        assert!(suspended.token.is_none());
    }

    #[tokio::test]
    async fn test_reset_password_flow() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let session = h.service.login("a@x.com", PASSWORD, None).await.unwrap();

        let token = h
            .service
            .request_password_reset("a@x.com")
            .await
            .unwrap()
            .token
            .unwrap();
        h.service
            .reset_password(&token, NEW_PASSWORD, None)
            .await
            .unwrap();

        assert!(matches!(
            h.service.login("a@x.com", PASSWORD, None).await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(h.service.login("a@x.com", NEW_PASSWORD, None).await.is_ok());

        // Existing sessions were revoked and the ticket is single-use
        assert!(matches!(
            h.service.refresh(&session.refresh_token, None).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            h.service.reset_password(&token, "An0ther-Passw0rd!", None).await,
            Err(AuthError::InvalidOrExpiredResetToken)
        ));
        assert!(h.users.get(user.id).unwrap().reset_token_hash.is_none());
    }

    /// Directory that yields inside `find_reset_ticket` so two resets
    /// interleave between the lookup and the write.
    struct YieldingDirectory(Arc<InMemoryUserDirectory>);

    #[async_trait::async_trait]
    impl UserDirectory for YieldingDirectory {
        async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepositoryError> {
            self.0.find_by_id(id).await
        }

        async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
            self.0.find_by_email(email).await
        }

        async fn find_reset_ticket(
            &self,
            token_hash: &str,
        ) -> Result<Option<PasswordResetTicket>, RepositoryError> {
            let ticket = self.0.find_reset_ticket(token_hash).await;
            tokio::task::yield_now().await;
            ticket
        }

        async fn update_password_hash(
            &self,
            id: Uuid,
            password_hash: &str,
            now: OffsetDateTime,
        ) -> Result<(), RepositoryError> {
            self.0.update_password_hash(id, password_hash, now).await
        }

        async fn set_reset_ticket(
            &self,
            ticket: &PasswordResetTicket,
        ) -> Result<(), RepositoryError> {
            self.0.set_reset_ticket(ticket).await
        }

        async fn consume_reset_ticket(
            &self,
            token_hash: &str,
            now: OffsetDateTime,
        ) -> Result<Option<Uuid>, RepositoryError> {
            self.0.consume_reset_ticket(token_hash, now).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_resets_with_one_ticket_have_single_winner() {
        let h = harness();
        h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let service = AuthService::new(
            Arc::new(test_config()),
            Arc::new(YieldingDirectory(h.users.clone())),
            h.tokens.clone(),
            Arc::new(h.clock.clone()),
        )
        .unwrap();

        let token = service
            .request_password_reset("a@x.com")
            .await
            .unwrap()
            .token
            .unwrap();

        let (a, b) = tokio::join!(
            service.reset_password(&token, NEW_PASSWORD, None),
            service.reset_password(&token, "An0ther-Passw0rd!", None),
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let (winner_password, loser) = if a.is_ok() {
            (NEW_PASSWORD, b)
        } else {
            ("An0ther-Passw0rd!", a)
        };
        assert!(matches!(loser, Err(AuthError::InvalidOrExpiredResetToken)));

        // The winner's password is the one stored
        assert!(service.login("a@x.com", winner_password, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_password_rejects_expired_or_unknown_ticket() {
        let h = harness();
        h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let token = h
            .service
            .request_password_reset("a@x.com")
            .await
            .unwrap()
            .token
            .unwrap();

        assert!(matches!(
            h.service.reset_password("deadbeef", NEW_PASSWORD, None).await,
            Err(AuthError::InvalidOrExpiredResetToken)
        ));

        h.clock.advance(Duration::hours(1) + Duration::seconds(1));
        assert!(matches!(
            h.service.reset_password(&token, NEW_PASSWORD, None).await,
            Err(AuthError::InvalidOrExpiredResetToken)
        ));
        assert!(h.service.login("a@x.com", PASSWORD, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_password_rejects_weak_password_and_keeps_ticket() {
        let h = harness();
        h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        let token = h
            .service
            .request_password_reset("a@x.com")
            .await
            .unwrap()
            .token
            .unwrap();

        assert!(matches!(
            h.service.reset_password(&token, "short", None).await,
            Err(AuthError::WeakPassword(_))
        ));
        assert!(h.service.reset_password(&token, NEW_PASSWORD, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_password() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Employee, UserStatus::Active);
        h.service.login("a@x.com", PASSWORD, None).await.unwrap();

        assert!(matches!(
            h.service
                .change_password(user.id, "Wrong123!", NEW_PASSWORD, None)
                .await,
            Err(AuthError::InvalidCredentials)
        ));
        assert!(matches!(
            h.service.change_password(user.id, PASSWORD, "weak", None).await,
            Err(AuthError::WeakPassword(_))
        ));

        let revoked = h
            .service
            .change_password(user.id, PASSWORD, NEW_PASSWORD, None)
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(h.service.login("a@x.com", NEW_PASSWORD, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_current_user_reads_directory() {
        let h = harness();
        let user = h.add_user("a@x.com", PASSWORD, Role::Customer, UserStatus::Active);

        let me = h.service.current_user(user.id).await.unwrap();
        assert_eq!(me, PublicUser::from(&user));
        assert!(matches!(
            h.service.current_user(Uuid::new_v4()).await,
            Err(AuthError::Unauthorized)
        ));
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let session = AuthSession {
            user: PublicUser {
                id: Uuid::nil(),
                name: "Ada".into(),
                email: "a@x.com".into(),
                role: Role::Admin,
            },
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_in: 3600,
            token_type: "Bearer",
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["accessToken"], "a");
        assert_eq!(json["refreshToken"], "r");
        assert_eq!(json["expiresIn"], 3600);
        assert_eq!(json["tokenType"], "Bearer");
        assert_eq!(json["role"], "admin");
        assert_eq!(json["email"], "a@x.com");
    }
}
