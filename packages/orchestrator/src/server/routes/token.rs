//! Token issuance for the admin API.

use std::sync::Arc;

use axum::extract::Extension;
use axum::Form;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::kernel::OrchestratorDeps;
use crate::server::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// `POST /token`: exchange admin credentials for a bearer token.
pub async fn issue_token(
    Extension(deps): Extension<Arc<OrchestratorDeps>>,
    Form(request): Form<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    if request.username != deps.admin_username || request.password != deps.admin_password {
        warn!(username = %request.username, "rejected token request");
        return Err(ApiError::Unauthorized);
    }

    let access_token = deps.jwt.create_token(&request.username, true)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
        expires_in: deps.jwt.ttl_secs(),
    }))
}
