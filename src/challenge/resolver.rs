//! Challenge Resolver endpoint
//!
//! Runs inside the transient resolver pod and answers exactly one HTTP-01
//! challenge, configured at process start.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{debug, info};

use super::WELL_KNOWN_PREFIX;

/// The single challenge this resolver answers
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Domain the validator must ask for
    pub domain: String,
    /// Expected token
    pub token: String,
    /// Response body
    pub key_authorization: String,
}

/// Build the resolver router
pub fn resolver_router(config: Arc<ResolverConfig>) -> Router {
    let path = format!("{WELL_KNOWN_PREFIX}/{{token}}");
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(&path, get(answer).post(answer))
        .with_state(config)
}

/// Host without its port, IPv6 literals included
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Key authorization for a request, or `None` when anything mismatches
pub fn challenge_response<'a>(config: &'a ResolverConfig, host: &str, path: &str) -> Option<&'a str> {
    let (base, token) = path.rsplit_once('/')?;

    if base != WELL_KNOWN_PREFIX {
        debug!(base, "base path mismatch");
        return None;
    }
    let host = strip_port(host);
    if host != config.domain {
        debug!(host, expected = %config.domain, "host mismatch");
        return None;
    }
    if token != config.token {
        debug!(token, "token mismatch");
        return None;
    }
    Some(&config.key_authorization)
}

async fn answer(State(config): State<Arc<ResolverConfig>>, headers: HeaderMap, uri: Uri) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.host())
        .unwrap_or_default();

    match challenge_response(&config, host, uri.path()) {
        Some(key_authorization) => {
            info!(domain = %config.domain, token = %config.token, "served challenge response");
            (
                StatusCode::OK,
                [(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")],
                key_authorization.to_string(),
            )
                .into_response()
        }
        None => {
            info!(host, path = %uri.path(), "rejected challenge request");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
