//! Shared application state

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::auth::{AuthService, AuthState};
use crate::config::Config;

/// Delivers password reset tokens to their owner, e.g. by email
#[async_trait]
pub trait ResetNotifier: Send + Sync {
    async fn send_reset_token(&self, email: &str, token: &str);
}

/// Records that a reset was issued without delivering anything. Used until a
/// mail transport is configured.
#[derive(Debug, Default)]
pub struct LogResetNotifier;

#[async_trait]
impl ResetNotifier for LogResetNotifier {
    async fn send_reset_token(&self, _email: &str, _token: &str) {
        tracing::warn!("Password reset issued but no delivery channel is configured");
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` when running on in-memory stores
    pub pool: Option<PgPool>,
    pub auth: Arc<AuthService>,
    pub reset_notifier: Arc<dyn ResetNotifier>,
}

impl AppState {
    pub fn new(config: Arc<Config>, pool: Option<PgPool>, auth: Arc<AuthService>) -> Self {
        Self {
            config,
            pool,
            auth,
            reset_notifier: Arc::new(LogResetNotifier),
        }
    }

    pub fn with_reset_notifier(mut self, notifier: Arc<dyn ResetNotifier>) -> Self {
        self.reset_notifier = notifier;
        self
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState::new(self.auth.clone())
    }
}
