//! Audit event names
//!
//! Auth events are emitted as structured `tracing` records on the `audit`
//! target. Using constants keeps the event names stable for log queries.

/// Target for audit log records
pub const AUDIT_TARGET: &str = "audit";

/// Authentication event types
pub mod auth_event {
    /// Successful login attempt
    pub const LOGIN_SUCCESS: &str = "login_success";

    /// Failed login attempt (unknown email, wrong password, inactive account)
    pub const LOGIN_FAILED: &str = "login_failed";

    /// User initiated logout (all refresh tokens revoked)
    pub const LOGOUT: &str = "logout";

    /// Refresh token exchanged for a new token pair
    pub const TOKEN_REFRESHED: &str = "token_refreshed";

    /// A revoked or rotated refresh token was presented again
    pub const REFRESH_TOKEN_REUSE: &str = "refresh_token_reuse";

    /// Password reset requested for an existing active account
    pub const PASSWORD_RESET_REQUESTED: &str = "password_reset_requested";

    /// Password reset completed with a valid ticket
    pub const PASSWORD_RESET_COMPLETED: &str = "password_reset_completed";

    /// Authenticated user changed their own password
    pub const PASSWORD_CHANGED: &str = "password_changed";

    /// Role or ownership check rejected an authenticated request
    pub const ACCESS_DENIED: &str = "access_denied";
}

/// Reasons attached to failure events
pub mod reason {
    pub const USER_NOT_FOUND: &str = "user_not_found";
    pub const INVALID_PASSWORD: &str = "invalid_password";
    pub const ACCOUNT_INACTIVE: &str = "account_inactive";
    pub const SUBJECT_MISMATCH: &str = "subject_mismatch";
    pub const CONCURRENT_ROTATION: &str = "concurrent_rotation";
    pub const ROLE_NOT_ALLOWED: &str = "role_not_allowed";
    pub const NOT_OWNER: &str = "not_owner";
    pub const TICKET_ALREADY_USED: &str = "ticket_already_used";
}
