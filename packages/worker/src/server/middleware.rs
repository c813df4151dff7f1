//! IP-allowlist middleware.
//!
//! Only the orchestrator should be able to reach a worker. The client IP is
//! taken from forwarding headers when present (workers often sit behind a
//! reverse proxy) and falls back to the socket address.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

/// Reject callers whose IP is not on the allowlist. An empty allowlist
/// disables the check (development).
pub async fn enforce_allowlist(
    allowed: Arc<Vec<IpAddr>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&request).unwrap_or_else(|| addr.ip());

    if !allowed.is_empty() && !allowed.contains(&ip) {
        warn!(ip = %ip, "rejected request from unlisted address");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "address not allowed" })),
        )
            .into_response();
    }

    next.run(request).await
}

/// Client IP from forwarding headers.
///
/// Priority: X-Forwarded-For (first entry), then X-Real-IP.
fn client_ip(request: &Request) -> Option<IpAddr> {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        return forwarded
            .to_str()
            .ok()
            .and_then(|s| s.split(',').next())
            .and_then(|s| s.trim().parse().ok());
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        return real_ip.to_str().ok().and_then(|s| s.parse().ok());
    }
    None
}
