//! Connection routing: classify each inbound request and dispatch it.
//!
//! Every request lands here, whether it arrived in plaintext on the listen
//! socket or decrypted out of a MITM'd CONNECT tunnel. Classification order:
//!
//! 1. `CONNECT` → tunnel handling (raw pipe or TLS interception).
//! 2. Host `localhost`, or `.localhost` with an empty or `_` prefix →
//!    dashboard.
//! 3. Host `<name>.localhost` → reverse-proxy; unresolved names get a 404.
//! 4. Absolute-URI request line (forward-proxy form) → same name resolution,
//!    but an unresolved name closes the connection without a response so the
//!    client's proxy-selection policy can fall back to a direct connection.
//! 5. A resolved target with `Upgrade: websocket` goes to the WebSocket
//!    bridge instead of the HTTP bridge.

use super::connect::handle_connect;
use super::error::ProxyError;
use super::server::AppState;
use super::{http, websocket};
use crate::dashboard;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Where a classified request should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// Render the service list.
    Dashboard,
    /// Resolve the name against the service mapping.
    Service(String),
}

/// Process a single proxied request.
pub async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    if req.method() == Method::CONNECT {
        return handle_connect(req, state).await;
    }

    // Absolute-form request lines mark forward-proxy traffic; unresolved
    // names there must close silently instead of answering 404.
    let forward = req.uri().authority().is_some();

    match classify(extract_host(&req).as_deref()) {
        RouteTarget::Dashboard => {
            let services = state.services.list().await;
            dashboard::render(&services, state.listen_port())
        }
        RouteTarget::Service(name) => match state.services.resolve(&name).await {
            Some(port) => {
                debug!("Routing '{}' to port {}", name, port);
                if websocket::is_upgrade(&req) {
                    websocket::handle_upgrade(req, port).await
                } else {
                    http::bridge(req, port, &state.backend_client).await
                }
            }
            None if forward => {
                debug!("No service named '{}'; closing forward request", name);
                Err(ProxyError::SilentClose)
            }
            None => Ok(not_found_response(&name)?),
        },
    }
}

/// Pull the request hostname from the URI authority or the Host header,
/// stripping any trailing `:port`.
fn extract_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.host().to_string());
    }

    let host = req.headers().get(HOST)?.to_str().ok()?;
    // IPv6 literals keep their brackets; everything else drops the port.
    let hostname = if host.starts_with('[') {
        host.split(']').next().map(|h| format!("{}]", h))?
    } else {
        host.split(':').next()?.to_string()
    };
    Some(hostname)
}

/// Classify a hostname into a routing target.
pub fn classify(hostname: Option<&str>) -> RouteTarget {
    let hostname = match hostname {
        Some(h) if !h.is_empty() => h,
        _ => return RouteTarget::Dashboard,
    };

    if hostname.eq_ignore_ascii_case("localhost") {
        return RouteTarget::Dashboard;
    }

    if let Some(prefix) = strip_suffix_ignore_case(hostname, ".localhost") {
        if prefix.is_empty() || prefix == "_" {
            return RouteTarget::Dashboard;
        }
        return RouteTarget::Service(prefix.to_string());
    }

    // Forward-proxy requests may name the service directly.
    RouteTarget::Service(hostname.to_string())
}

fn strip_suffix_ignore_case<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    if s.len() < suffix.len() {
        return None;
    }
    let (head, tail) = s.split_at(s.len() - suffix.len());
    if tail.eq_ignore_ascii_case(suffix) {
        Some(head)
    } else {
        None
    }
}

/// Create an empty response body.
pub fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
pub fn full_body(content: String) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// 404 for a reverse-proxy name with no running service.
fn not_found_response(
    name: &str,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "text/plain")
        .body(full_body(format!(
            "No service named '{}' is currently running\n",
            name
        )))?)
}
