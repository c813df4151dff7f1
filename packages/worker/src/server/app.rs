//! Worker application setup.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Extension, Request};
use axum::middleware::{self, Next};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::runtime::ExecutionRuntime;
use crate::server::middleware::enforce_allowlist;
use crate::server::routes;

/// Build the worker router. Every route sits behind the IP allowlist.
pub fn build_app(runtime: Arc<ExecutionRuntime>, allowed_ips: Vec<IpAddr>) -> Router {
    let allowed = Arc::new(allowed_ips);

    Router::new()
        .route("/execute", post(routes::execute))
        .route("/status/:job_id", get(routes::job_status))
        .route("/status", get(routes::capabilities))
        .route("/health", get(routes::health))
        .layer(middleware::from_fn(
            move |connect_info: ConnectInfo<SocketAddr>, req: Request, next: Next| {
                enforce_allowlist(allowed.clone(), connect_info, req, next)
            },
        ))
        .layer(Extension(runtime))
        .layer(TraceLayer::new_for_http())
}
