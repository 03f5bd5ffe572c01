//! HTTP CONNECT handling for tunneled traffic.
//!
//! Flow for `CONNECT host:port`:
//!
//! 1. Port 443 with a loaded CA and an issuable leaf → answer
//!    `200 Connection Established`, then terminate TLS in place on the
//!    upgraded stream and route the decrypted requests normally.
//! 2. Anything else → dial the literal `host:port` first, and only on
//!    success answer 200 and splice bytes verbatim. A failed dial drops the
//!    connection with zero bytes written, so proxy-selection policy on the
//!    client can fall back to a direct connection.

use super::error::ProxyError;
use super::route::empty_body;
use super::server::AppState;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Handle a CONNECT request.
pub async fn handle_connect(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let target = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidConnect("Missing authority in CONNECT request".into()))?
        .to_string();

    let (host, port) = parse_host_port(&target)?;

    debug!("CONNECT request to {}:{}", host, port);

    if port == 443 {
        if let Some(engine) = &state.mitm {
            // A hostname the CA cannot issue for falls through to the raw
            // pipe rather than failing the tunnel.
            if engine.get_or_issue(&host).is_ok() {
                return intercept_tunnel(req, host, engine.clone(), state.clone());
            }
            debug!("No leaf available for {}; passing tunnel through", host);
        }
    }

    raw_tunnel(req, host, port).await
}

/// Establish a TLS-intercepting tunnel.
///
/// Returns 200 to trigger the upgrade, then terminates TLS on the upgraded
/// stream and feeds the decrypted requests back through the router.
fn intercept_tunnel(
    req: Request<Incoming>,
    host: String,
    engine: Arc<super::tls::MitmEngine>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = engine.terminate(upgraded, &host, state).await {
                    debug!("Intercepted tunnel for {} ended: {}", host, e);
                }
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}: {}", host, e);
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())?)
}

/// Establish a transparent byte pipe to the literal `host:port`.
///
/// The upstream dial happens before the 200 is written: an unreachable
/// target must close the client connection with zero bytes.
async fn raw_tunnel(
    req: Request<Incoming>,
    host: String,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let addr = format!("{}:{}", host, port);
    let upstream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("CONNECT target {} unreachable: {}; closing silently", addr, e);
            return Err(ProxyError::SilentClose);
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = pipe(upgraded, upstream).await {
                    debug!("Tunnel to {} ended: {}", addr, e);
                }
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}: {}", addr, e);
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())?)
}

/// Splice bytes both ways until either side closes.
async fn pipe(upgraded: Upgraded, mut upstream: TcpStream) -> Result<(), ProxyError> {
    let mut client = TokioIo::new(upgraded);
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Parse host:port from a CONNECT authority.
///
/// Examples:
/// - `web.localhost:443` -> ("web.localhost", 443)
/// - `web.localhost` -> ("web.localhost", 443) (default port)
/// - `[::1]:8443` -> ("::1", 8443)
fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidConnect(format!("Invalid port: {}", port_str)))?;

        if host.starts_with('[') && host.ends_with(']') {
            return Ok((host[1..host.len() - 1].to_string(), port));
        }

        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}
