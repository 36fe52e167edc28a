//! Authentication routes

use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::{
    auth::{AuthSession, AuthUser, PublicUser},
    error::{ApiError, ApiResult},
    state::AppState,
};

use super::extract_client_ip;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(alias = "refresh_token")]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub message: String,
    pub revoked: u64,
}

/// Sleep until at least `floor` has passed since `start`, so failing and
/// succeeding requests take the same time.
async fn pad_response_time(start: Instant, floor: Duration) {
    let elapsed = start.elapsed();
    if elapsed < floor {
        tokio::time::sleep(floor - elapsed).await;
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Login with email and password
///
/// Every attempt takes at least `AUTH_MIN_RESPONSE_MS` so response time does
/// not reveal whether the email is registered.
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<AuthSession>> {
    let start = Instant::now();
    let client_ip = extract_client_ip(&headers);

    let result = state
        .auth
        .login(&req.email, &req.password, client_ip.as_deref())
        .await;

    pad_response_time(start, state.auth.config().min_auth_response).await;
    Ok(Json(result?))
}

/// Exchange a refresh token for a new token pair
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<AuthSession>> {
    let client_ip = extract_client_ip(&headers);
    let session = state
        .auth
        .refresh(&req.refresh_token, client_ip.as_deref())
        .await?;
    Ok(Json(session))
}

/// Request password reset
pub async fn forgot_password(
    State(state): State<AppState>,
    Json(req): Json<ForgotPasswordRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let start = Instant::now();

    let result = state.auth.request_password_reset(&req.email).await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            pad_response_time(start, state.auth.config().min_auth_response).await;
            return Err(e.into());
        }
    };

    if let Some(token) = &outcome.token {
        state
            .reset_notifier
            .send_reset_token(req.email.trim(), token)
            .await;
    }

    pad_response_time(start, state.auth.config().min_auth_response).await;
    Ok(Json(MessageResponse {
        message: outcome.message.to_string(),
    }))
}

/// Set a new password with a reset token
pub async fn reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResetPasswordRequest>,
) -> ApiResult<Json<MessageResponse>> {
    if req.token.trim().is_empty() {
        return Err(ApiError::InvalidResetToken);
    }

    let client_ip = extract_client_ip(&headers);
    state
        .auth
        .reset_password(req.token.trim(), &req.password, client_ip.as_deref())
        .await?;

    Ok(Json(MessageResponse {
        message: "Password has been reset. Please log in with your new password.".to_string(),
    }))
}

/// Logout: revoke every refresh token of the current user
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth_user: AuthUser,
) -> ApiResult<Json<LogoutResponse>> {
    let client_ip = extract_client_ip(&headers);
    let revoked = state.auth.logout(auth_user.id, client_ip.as_deref()).await?;

    Ok(Json(LogoutResponse {
        message: "Logged out successfully".to_string(),
        revoked,
    }))
}

/// Change password of the current user
pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    auth_user: AuthUser,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let client_ip = extract_client_ip(&headers);
    state
        .auth
        .change_password(
            auth_user.id,
            &req.current_password,
            &req.new_password,
            client_ip.as_deref(),
        )
        .await?;

    Ok(Json(MessageResponse {
        message: "Password changed. Other sessions have been signed out.".to_string(),
    }))
}

/// Current user
pub async fn me(State(state): State<AppState>, auth_user: AuthUser) -> ApiResult<Json<PublicUser>> {
    let user = state.auth.current_user(auth_user.id).await?;
    Ok(Json(user))
}
