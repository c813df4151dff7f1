//! Bearer-token authentication middleware.

use std::sync::Arc;

use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::auth::JwtService;
use super::error::ApiError;

/// Authenticated caller, inserted into request extensions.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub username: String,
    pub is_admin: bool,
}

/// Reject requests without a valid bearer token.
pub async fn require_auth(
    jwt: Arc<JwtService>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match extract_auth_user(&request, &jwt) {
        Some(user) => {
            debug!(username = %user.username, "authenticated request");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        None => ApiError::Unauthorized.into_response(),
    }
}

fn extract_auth_user(
    request: &Request<axum::body::Body>,
    jwt: &JwtService,
) -> Option<AuthUser> {
    let auth_header = request.headers().get("authorization")?;
    let auth_str = auth_header.to_str().ok()?;
    let token = auth_str.strip_prefix("Bearer ").unwrap_or(auth_str);

    let claims = jwt.verify_token(token).ok()?;
    Some(AuthUser {
        username: claims.sub,
        is_admin: claims.admin,
    })
}
