//! User directory: the auth core's read view of user accounts, plus the two
//! writes it is allowed to make (password hash and reset ticket).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bms_shared::User;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::RepositoryError;
use super::tokens::PasswordResetTicket;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepositoryError>;

    /// Case-insensitive lookup
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError>;

    /// The reset ticket whose stored hash equals `token_hash`, expired or not
    async fn find_reset_ticket(
        &self,
        token_hash: &str,
    ) -> Result<Option<PasswordResetTicket>, RepositoryError>;

    async fn update_password_hash(
        &self,
        id: Uuid,
        password_hash: &str,
        now: OffsetDateTime,
    ) -> Result<(), RepositoryError>;

    /// Store a reset ticket, replacing any previous one
    async fn set_reset_ticket(&self, ticket: &PasswordResetTicket) -> Result<(), RepositoryError>;

    /// Clear the unexpired ticket matching `token_hash` and return its owner.
    /// `None` when the ticket is unknown, expired or already consumed, so at
    /// most one caller ever gets the owner back.
    async fn consume_reset_ticket(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, RepositoryError>;
}

// =============================================================================
// PostgreSQL
// =============================================================================

const USER_COLUMNS: &str = "id, email, name, role, status, password_hash, \
     reset_token_hash, reset_token_expires_at, created_at, updated_at";

pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ResetTicketRow {
    id: Uuid,
    reset_token_hash: String,
    reset_token_expires_at: OffsetDateTime,
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepositoryError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_reset_ticket(
        &self,
        token_hash: &str,
    ) -> Result<Option<PasswordResetTicket>, RepositoryError> {
        let row: Option<ResetTicketRow> = sqlx::query_as(
            r#"
            SELECT id, reset_token_hash, reset_token_expires_at
            FROM users
            WHERE reset_token_hash = $1 AND reset_token_expires_at IS NOT NULL
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PasswordResetTicket {
            user_id: r.id,
            token_hash: r.reset_token_hash,
            expires_at: r.reset_token_expires_at,
        }))
    }

    async fn update_password_hash(
        &self,
        id: Uuid,
        password_hash: &str,
        now: OffsetDateTime,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(password_hash)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn set_reset_ticket(&self, ticket: &PasswordResetTicket) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET reset_token_hash = $2, reset_token_expires_at = $3
            WHERE id = $1
            "#,
        )
        .bind(ticket.user_id)
        .bind(&ticket.token_hash)
        .bind(ticket.expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn consume_reset_ticket(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, RepositoryError> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET reset_token_hash = NULL, reset_token_expires_at = NULL
            WHERE reset_token_hash = $1 AND reset_token_expires_at > $2
            RETURNING id
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local directory for tests and development seeding
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: Mutex<HashMap<Uuid, User>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, User>> {
        self.users.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace a user. Emails are stored lowercased.
    pub fn insert(&self, mut user: User) {
        user.email = user.email.to_lowercase();
        self.lock().insert(user.id, user);
    }

    /// Apply `f` to a stored user, e.g. to suspend or demote it in a test
    pub fn update<F: FnOnce(&mut User)>(&self, id: Uuid, f: F) {
        if let Some(user) = self.lock().get_mut(&id) {
            f(user);
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<User> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<User> {
        self.lock().get(&id).cloned()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, RepositoryError> {
        Ok(self.get(id))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, RepositoryError> {
        let email = email.to_lowercase();
        Ok(self.lock().values().find(|u| u.email == email).cloned())
    }

    async fn find_reset_ticket(
        &self,
        token_hash: &str,
    ) -> Result<Option<PasswordResetTicket>, RepositoryError> {
        Ok(self.lock().values().find_map(|u| {
            match (&u.reset_token_hash, u.reset_token_expires_at) {
                (Some(hash), Some(expires_at)) if hash == token_hash => Some(PasswordResetTicket {
                    user_id: u.id,
                    token_hash: hash.clone(),
                    expires_at,
                }),
                _ => None,
            }
        }))
    }

    async fn update_password_hash(
        &self,
        id: Uuid,
        password_hash: &str,
        now: OffsetDateTime,
    ) -> Result<(), RepositoryError> {
        let mut users = self.lock();
        let user = users.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        user.password_hash = password_hash.to_string();
        user.updated_at = now;
        Ok(())
    }

    async fn set_reset_ticket(&self, ticket: &PasswordResetTicket) -> Result<(), RepositoryError> {
        let mut users = self.lock();
        let user = users
            .get_mut(&ticket.user_id)
            .ok_or(RepositoryError::NotFound)?;
        user.reset_token_hash = Some(ticket.token_hash.clone());
        user.reset_token_expires_at = Some(ticket.expires_at);
        Ok(())
    }

    async fn consume_reset_ticket(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, RepositoryError> {
        let mut users = self.lock();
        let user = users.values_mut().find(|u| {
            u.reset_token_hash.as_deref() == Some(token_hash)
                && u.reset_token_expires_at.is_some_and(|at| at > now)
        });
        Ok(user.map(|u| {
            u.reset_token_hash = None;
            u.reset_token_expires_at = None;
            u.id
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use bms_shared::{Role, UserStatus};
    use time::Duration;

    fn user(email: &str) -> User {
        let now = OffsetDateTime::now_utc();
        User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: "Test User".to_string(),
            role: Role::Employee,
            status: UserStatus::Active,
            password_hash: "hash".to_string(),
            reset_token_hash: None,
            reset_token_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_find_by_email_is_case_insensitive() {
        let directory = InMemoryUserDirectory::new();
        let u = user("Mixed@Example.com");
        directory.insert(u.clone());

        let found = directory
            .find_by_email("MIXED@example.COM")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, u.id);
        assert!(directory.find_by_email("other@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_ticket_lifecycle() {
        let directory = InMemoryUserDirectory::new();
        let u = user("a@x.com");
        directory.insert(u.clone());

        let now = OffsetDateTime::now_utc();
        let (_, first) = PasswordResetTicket::issue(u.id, now, Duration::hours(1));
        directory.set_reset_ticket(&first).await.unwrap();

        // A new ticket overwrites the old one
        let (_, second) = PasswordResetTicket::issue(u.id, now, Duration::hours(1));
        directory.set_reset_ticket(&second).await.unwrap();
        assert!(directory
            .find_reset_ticket(&first.token_hash)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            directory.find_reset_ticket(&second.token_hash).await.unwrap(),
            Some(second.clone())
        );

        assert_eq!(
            directory
                .consume_reset_ticket(&second.token_hash, now)
                .await
                .unwrap(),
            Some(u.id)
        );
        assert!(directory
            .find_reset_ticket(&second.token_hash)
            .await
            .unwrap()
            .is_none());
        // Second consume finds nothing
        assert_eq!(
            directory
                .consume_reset_ticket(&second.token_hash, now)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_expired_ticket_is_not_consumed() {
        let directory = InMemoryUserDirectory::new();
        let u = user("a@x.com");
        directory.insert(u.clone());

        let now = OffsetDateTime::now_utc();
        let (_, ticket) = PasswordResetTicket::issue(u.id, now, Duration::hours(1));
        directory.set_reset_ticket(&ticket).await.unwrap();

        let later = now + Duration::hours(1);
        assert_eq!(
            directory
                .consume_reset_ticket(&ticket.token_hash, later)
                .await
                .unwrap(),
            None
        );
        assert!(directory.get(u.id).unwrap().reset_token_hash.is_some());
    }

    #[tokio::test]
    async fn test_writes_to_unknown_user_fail() {
        let directory = InMemoryUserDirectory::new();
        let now = OffsetDateTime::now_utc();
        assert!(matches!(
            directory
                .update_password_hash(Uuid::new_v4(), "h", now)
                .await,
            Err(RepositoryError::NotFound)
        ));
        let (_, ticket) = PasswordResetTicket::issue(Uuid::new_v4(), now, Duration::hours(1));
        assert!(matches!(
            directory.set_reset_ticket(&ticket).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_pg_email_unique_ignores_case() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = bms_shared::create_pool(&url, 5).await.unwrap();
        bms_shared::run_migrations(&pool).await.unwrap();

        async fn insert(pool: &PgPool, id: Uuid, email: String) -> Result<(), sqlx::Error> {
            sqlx::query(
                "INSERT INTO users (id, email, name, role, status, password_hash) \
                 VALUES ($1, $2, 'Test', 'employee', 'active', 'x')",
            )
            .bind(id)
            .bind(email)
            .execute(pool)
            .await?;
            Ok(())
        }

        let tag = Uuid::new_v4();
        let id = Uuid::new_v4();
        insert(&pool, id, format!("Case-{tag}@Test.invalid")).await.unwrap();
        let duplicate = insert(&pool, Uuid::new_v4(), format!("case-{tag}@test.invalid")).await;
        let code = match duplicate {
            Err(sqlx::Error::Database(db_err)) => db_err.code().map(|c| c.into_owned()),
            other => panic!("expected unique violation, got {other:?}"),
        };
        assert_eq!(code.as_deref(), Some("23505"));

        let directory = PgUserDirectory::new(pool.clone());
        let found = directory
            .find_by_email(&format!("CASE-{tag}@TEST.INVALID"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, id);
    }
}
