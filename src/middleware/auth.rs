use axum::extract::FromRequestParts;
use uuid::Uuid;

use crate::error::AppError;

/// Authenticated principal, supplied per request by the upstream identity
/// provider. The core trusts these headers and never re-validates credentials.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub role: String,
}

pub fn ensure_role(user: &AuthUser, role: &str) -> Result<(), AppError> {
    if user.role != role {
        return Err(AppError::Forbidden);
    }
    Ok(())
}

pub fn ensure_admin(user: &AuthUser) -> Result<(), AppError> {
    ensure_role(user, "admin")
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;
    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let user_header = parts
            .headers
            .get("x-user-id")
            .ok_or_else(|| AppError::BadRequest("Missing x-user-id header".into()))?;

        let user_str = user_header
            .to_str()
            .map_err(|_| AppError::BadRequest("Invalid x-user-id header".into()))?;

        let user_id = Uuid::parse_str(user_str)
            .map_err(|_| AppError::BadRequest("Invalid user id".into()))?;

        let role = parts
            .headers
            .get("x-user-role")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("customer")
            .to_string();

        let email = parts
            .headers
            .get("x-user-email")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        Ok(AuthUser {
            user_id,
            email,
            role,
        })
    }
}
