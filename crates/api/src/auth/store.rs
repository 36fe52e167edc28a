//! Refresh token persistence
//!
//! Tokens are never deleted: revocation flips `revoked` and records who and
//! when, and rotation links the old record to its successor through
//! `replaced_by_token`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bms_shared::RefreshToken;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::error::RepositoryError;

/// A refresh token about to be persisted
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: Uuid,
    pub token: String,
    pub issued_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub created_by_ip: Option<String>,
}

impl NewRefreshToken {
    fn into_record(self) -> RefreshToken {
        RefreshToken {
            id: Uuid::new_v4(),
            token: self.token,
            user_id: self.user_id,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            created_by_ip: self.created_by_ip,
            revoked: false,
            revoked_at: None,
            revoked_by_ip: None,
            replaced_by_token: None,
        }
    }
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn create(&self, token: NewRefreshToken) -> Result<RefreshToken, RepositoryError>;

    /// Any record with this value, revoked or not
    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>, RepositoryError>;

    /// Only non-revoked records. Expiry is left to the caller.
    async fn find_active_by_token(
        &self,
        token: &str,
    ) -> Result<Option<RefreshToken>, RepositoryError>;

    /// Revoke one record. Revoking an already revoked record is a no-op.
    async fn revoke(
        &self,
        id: Uuid,
        by_ip: Option<&str>,
        replaced_by: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<(), RepositoryError>;

    /// Revoke every non-revoked record of a user in one statement.
    /// Returns the number of records revoked.
    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        by_ip: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<u64, RepositoryError>;

    /// Atomically revoke `old_token` (only if still active) and insert its
    /// successor. Fails with `AlreadyRevoked`, writing nothing, when another
    /// request got there first.
    async fn rotate(
        &self,
        old_token: &str,
        replacement: NewRefreshToken,
        by_ip: Option<&str>,
    ) -> Result<RefreshToken, RepositoryError>;
}

// =============================================================================
// PostgreSQL
// =============================================================================

const RETURNING_COLUMNS: &str = "id, token, user_id, issued_at, expires_at, created_by_ip, \
     revoked, revoked_at, revoked_by_ip, replaced_by_token";

pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_insert_error(err: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db_err) = &err {
        // PostgreSQL unique violation
        if db_err.code().as_deref() == Some("23505") {
            return RepositoryError::Conflict("refresh token already exists".to_string());
        }
    }
    RepositoryError::Database(err)
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn create(&self, token: NewRefreshToken) -> Result<RefreshToken, RepositoryError> {
        let record = token.into_record();

        let sql = format!(
            r#"
            INSERT INTO refresh_tokens (id, token, user_id, issued_at, expires_at, created_by_ip)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {RETURNING_COLUMNS}
            "#
        );
        let created = sqlx::query_as::<_, RefreshToken>(&sql)
            .bind(record.id)
            .bind(&record.token)
            .bind(record.user_id)
            .bind(record.issued_at)
            .bind(record.expires_at)
            .bind(&record.created_by_ip)
            .fetch_one(&self.pool)
            .await
            .map_err(map_insert_error)?;

        Ok(created)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>, RepositoryError> {
        let sql = format!("SELECT {RETURNING_COLUMNS} FROM refresh_tokens WHERE token = $1");
        let record = sqlx::query_as::<_, RefreshToken>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn find_active_by_token(
        &self,
        token: &str,
    ) -> Result<Option<RefreshToken>, RepositoryError> {
        let sql = format!(
            "SELECT {RETURNING_COLUMNS} FROM refresh_tokens WHERE token = $1 AND revoked = FALSE"
        );
        let record = sqlx::query_as::<_, RefreshToken>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn revoke(
        &self,
        id: Uuid,
        by_ip: Option<&str>,
        replaced_by: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = $2, revoked_by_ip = $3, replaced_by_token = $4
            WHERE id = $1 AND revoked = FALSE
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(by_ip)
        .bind(replaced_by)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(token_id = %id, "refresh_tokens: revoke was a no-op");
        }
        Ok(())
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        by_ip: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = $2, revoked_by_ip = $3
            WHERE user_id = $1 AND revoked = FALSE
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(by_ip)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn rotate(
        &self,
        old_token: &str,
        replacement: NewRefreshToken,
        by_ip: Option<&str>,
    ) -> Result<RefreshToken, RepositoryError> {
        let record = replacement.into_record();
        let mut tx = self.pool.begin().await?;

        // Conditional update: under concurrent rotation of the same token the
        // second writer blocks on the row lock, then sees revoked = TRUE.
        let revoked = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = $2, revoked_by_ip = $3, replaced_by_token = $4
            WHERE token = $1 AND revoked = FALSE
            "#,
        )
        .bind(old_token)
        .bind(record.issued_at)
        .bind(by_ip)
        .bind(&record.token)
        .execute(&mut *tx)
        .await?;

        if revoked.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::AlreadyRevoked);
        }

        let sql = format!(
            r#"
            INSERT INTO refresh_tokens (id, token, user_id, issued_at, expires_at, created_by_ip)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {RETURNING_COLUMNS}
            "#
        );
        // An error here drops `tx`, which rolls the revocation back
        let created = sqlx::query_as::<_, RefreshToken>(&sql)
            .bind(record.id)
            .bind(&record.token)
            .bind(record.user_id)
            .bind(record.issued_at)
            .bind(record.expires_at)
            .bind(&record.created_by_ip)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_insert_error)?;

        tx.commit().await?;
        Ok(created)
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local store for tests and single-node development. One mutex
/// guards all records, which makes `rotate` trivially atomic.
#[derive(Default)]
pub struct InMemoryRefreshTokenStore {
    tokens: Mutex<HashMap<String, RefreshToken>>,
}

impl InMemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RefreshToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every record belonging to `user_id`
    pub fn records_for_user(&self, user_id: Uuid) -> Vec<RefreshToken> {
        let mut records: Vec<_> = self
            .lock()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|t| t.issued_at);
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn create(&self, token: NewRefreshToken) -> Result<RefreshToken, RepositoryError> {
        let mut tokens = self.lock();
        if tokens.contains_key(&token.token) {
            return Err(RepositoryError::Conflict(
                "refresh token already exists".to_string(),
            ));
        }
        let record = token.into_record();
        tokens.insert(record.token.clone(), record.clone());
        Ok(record)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<RefreshToken>, RepositoryError> {
        Ok(self.lock().get(token).cloned())
    }

    async fn find_active_by_token(
        &self,
        token: &str,
    ) -> Result<Option<RefreshToken>, RepositoryError> {
        Ok(self.lock().get(token).filter(|t| !t.revoked).cloned())
    }

    async fn revoke(
        &self,
        id: Uuid,
        by_ip: Option<&str>,
        replaced_by: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<(), RepositoryError> {
        let mut tokens = self.lock();
        if let Some(record) = tokens.values_mut().find(|t| t.id == id && !t.revoked) {
            record.revoked = true;
            record.revoked_at = Some(now);
            record.revoked_by_ip = by_ip.map(str::to_string);
            record.replaced_by_token = replaced_by.map(str::to_string);
        }
        Ok(())
    }

    async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        by_ip: Option<&str>,
        now: OffsetDateTime,
    ) -> Result<u64, RepositoryError> {
        let mut count = 0;
        for record in self
            .lock()
            .values_mut()
            .filter(|t| t.user_id == user_id && !t.revoked)
        {
            record.revoked = true;
            record.revoked_at = Some(now);
            record.revoked_by_ip = by_ip.map(str::to_string);
            count += 1;
        }
        Ok(count)
    }

    async fn rotate(
        &self,
        old_token: &str,
        replacement: NewRefreshToken,
        by_ip: Option<&str>,
    ) -> Result<RefreshToken, RepositoryError> {
        let mut tokens = self.lock();

        if tokens.contains_key(&replacement.token) {
            return Err(RepositoryError::Conflict(
                "refresh token already exists".to_string(),
            ));
        }

        let old = tokens
            .get_mut(old_token)
            .filter(|t| !t.revoked)
            .ok_or(RepositoryError::AlreadyRevoked)?;
        old.revoked = true;
        old.revoked_at = Some(replacement.issued_at);
        old.revoked_by_ip = by_ip.map(str::to_string);
        old.replaced_by_token = Some(replacement.token.clone());

        let record = replacement.into_record();
        tokens.insert(record.token.clone(), record.clone());
        Ok(record)
    }
}
