//! Mutating Admission Webhook
//!
//! Deployments flagged by the materializer (`cert.injector.ko/mount`) get the
//! named TLS secret mounted at admission time. Keeping the mount out of the
//! reconciler means a certificate can exist while the webhook is down; the
//! next admitted write picks it up.

pub mod deployment;

use axum::routing::{get, post};
use axum::Router;

/// Path the API server posts admission reviews to
pub const MUTATE_PATH: &str = "/api/v1/mutate";

/// Create the webhook router
///
/// - POST /api/v1/mutate - Deployment certificate injection
/// - GET /healthz - liveness
pub fn webhook_router() -> Router {
    Router::new()
        .route(MUTATE_PATH, post(deployment::mutate_handler))
        .route("/healthz", get(|| async { "ok" }))
}
