//! Bearer-token authentication and authorization guards

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use bms_shared::Role;
use uuid::Uuid;

use super::error::{AuthError, AuthResult, RepositoryError};
use super::service::AuthService;
use crate::audit_constants::{auth_event, reason, AUDIT_TARGET};
use crate::error::ApiError;

/// State for the auth middleware
#[derive(Clone)]
pub struct AuthState {
    pub service: Arc<AuthService>,
}

impl AuthState {
    pub fn new(service: Arc<AuthService>) -> Self {
        Self { service }
    }

    /// Resolve an access token to the user it belongs to. With user
    /// re-verification on, the directory record wins over the claims, and a
    /// deleted or deactivated user is rejected even while the token is valid.
    pub async fn authenticate(&self, token: &str) -> Result<AuthUser, ApiError> {
        let claims = self
            .service
            .jwt()
            .verify_access_token(token, self.service.now())
            .map_err(|e| {
                tracing::debug!(error = %e, "require_auth: Access token rejected");
                AuthError::from(e)
            })?;

        if !self.service.config().reverify_user {
            return Ok(AuthUser {
                id: claims.sub,
                name: claims.name,
                email: claims.email,
                role: claims.role,
            });
        }

        let user = self
            .service
            .users()
            .find_by_id(claims.sub)
            .await?
            .ok_or_else(|| {
                tracing::warn!(user_id = %claims.sub, "require_auth: Token subject no longer exists");
                ApiError::Unauthorized
            })?;

        if !user.status.is_active() {
            tracing::warn!(user_id = %user.id, status = %user.status, "require_auth: Account not active");
            return Err(ApiError::Unauthorized);
        }

        Ok(AuthUser {
            id: user.id,
            name: user.name,
            email: user.email,
            role: user.role,
        })
    }
}

/// Authenticated user, attached to the request by `require_auth`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

impl AuthUser {
    pub fn has_role(&self, allowed: &[Role]) -> bool {
        allowed.contains(&self.role)
    }

    /// `Forbidden` unless the user's role is one of `allowed`
    pub fn require_role(&self, allowed: &[Role]) -> AuthResult<()> {
        if self.has_role(allowed) {
            return Ok(());
        }
        tracing::warn!(
            target: AUDIT_TARGET,
            event = auth_event::ACCESS_DENIED,
            reason = reason::ROLE_NOT_ALLOWED,
            user_id = %self.id,
            role = %self.role,
            "Role not permitted"
        );
        Err(AuthError::Forbidden)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }
}

/// Middleware that requires a valid access token
pub async fn require_auth(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer(req.headers())?;
    let user = state.authenticate(token).await?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

/// Set of roles a route accepts. Layer with `require_roles` after
/// `require_auth`.
#[derive(Debug, Clone)]
pub struct RoleGuard {
    allowed: Arc<[Role]>,
}

impl RoleGuard {
    pub fn new(allowed: impl Into<Arc<[Role]>>) -> Self {
        Self {
            allowed: allowed.into(),
        }
    }

    pub fn admin_only() -> Self {
        Self::new([Role::Admin])
    }
}

/// Middleware rejecting users whose role is not in the guard's set
pub async fn require_roles(
    State(guard): State<RoleGuard>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user = req
        .extensions()
        .get::<AuthUser>()
        .ok_or(ApiError::Unauthorized)?;
    user.require_role(&guard.allowed)?;

    Ok(next.run(req).await)
}

/// Resolves the owner of a resource for ownership checks
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    async fn owner_of(&self, resource_id: Uuid) -> Result<Option<Uuid>, RepositoryError>;
}

/// Admins pass without a lookup. Everyone else must own the resource; an
/// unknown resource is `Forbidden` so ids cannot be probed.
pub async fn require_resource_owner<L>(
    user: &AuthUser,
    resource_id: Uuid,
    lookup: &L,
) -> AuthResult<()>
where
    L: OwnerLookup + ?Sized,
{
    if user.role.is_admin() {
        return Ok(());
    }

    match lookup.owner_of(resource_id).await? {
        Some(owner) if owner == user.id => Ok(()),
        _ => {
            tracing::warn!(
                target: AUDIT_TARGET,
                event = auth_event::ACCESS_DENIED,
                reason = reason::NOT_OWNER,
                user_id = %user.id,
                resource_id = %resource_id,
                "Resource ownership check failed"
            );
            Err(AuthError::Forbidden)
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header. The scheme is
/// matched case-insensitively.
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(ApiError::Unauthorized)?;

    let header = header.to_str().map_err(|_| ApiError::Unauthorized)?;

    let (scheme, token) = header.split_once(' ').ok_or(ApiError::Unauthorized)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(ApiError::Unauthorized);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(ApiError::Unauthorized);
    }

    Ok(token)
}
