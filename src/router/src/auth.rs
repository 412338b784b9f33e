//! Bearer-token authentication for the admin surface
//!
//! Every maintenance route requires `Authorization: Bearer <admin.admin_key>`.
//! Without a configured key the routes are disabled outright.

use std::sync::Arc;

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::endpoints::ApiError;

/// Extract the bearer token from the Authorization header
fn bearer_token(headers: &HeaderMap) -> Result<&str, &'static str> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or("Missing Authorization header")?
        .to_str()
        .map_err(|_| "Invalid Authorization header")?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or("Authorization header must use Bearer scheme")
}

/// Axum middleware function for admin authentication
///
/// Returns 403 when no admin key is configured and 401 when the token is missing
/// or does not match.
pub async fn admin_auth_middleware(
    admin_key: Option<Arc<str>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(admin_key) = admin_key else {
        return (
            StatusCode::FORBIDDEN,
            ApiError::new("forbidden", "Admin API is disabled: no admin key configured"),
        )
            .into_response();
    };

    let rejection = match bearer_token(request.headers()) {
        Ok(token) if token == &*admin_key => None,
        Ok(_) => {
            log::warn!("Rejected admin request with an invalid key");
            Some("Invalid admin key")
        }
        Err(message) => Some(message),
    };

    match rejection {
        None => next.run(request).await,
        Some(message) => (
            StatusCode::UNAUTHORIZED,
            ApiError::new("unauthorized", message),
        )
            .into_response(),
    }
}
