//! Application setup and router construction.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::Method;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::OrchestratorDeps;
use crate::server::middleware::require_auth;
use crate::server::routes::{admin, health, jobs, metrics, token};

/// Build the Axum application router.
///
/// Job submission and the operational endpoints require a bearer token;
/// health, metrics, scheduler state, and token issuance are open.
pub fn build_app(deps: Arc<OrchestratorDeps>) -> Router {
    let jwt = deps.jwt.clone();

    let authed = Router::new()
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/jobs/:id/screenshots", get(jobs::job_screenshots))
        .route("/process", post(admin::process_now))
        .route("/recover", post(admin::recover_now))
        .route("/scheduler/reset", post(admin::scheduler_reset))
        .layer(middleware::from_fn(move |req, next| {
            require_auth(jwt.clone(), req, next)
        }));

    let public = Router::new()
        .route("/scheduler", get(admin::scheduler_status))
        .route("/metrics", get(metrics::metrics))
        .route("/health", get(health::health))
        .route("/token", post(token::issue_token));

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    authed
        .merge(public)
        .layer(Extension(deps))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
