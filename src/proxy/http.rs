//! HTTP proxy bridge: forward one request/response pair to a backend port.
//!
//! The inbound request is rewritten to target `localhost:<port>` with its
//! path, query, method, and streamed body intact. Conditional-request
//! headers (`If-None-Match`, `If-Modified-Since`) are stripped so cached
//! 304s never loop through the proxy layer, and the hop-by-hop `Connection`
//! header is dropped so the pooled backend leg stays keep-alive regardless
//! of what the client asked for. Redirects are not followed; the backend's
//! 3xx status and `Location` header pass through verbatim. Backend
//! connectivity failures surface here and only here, as a 502 naming the
//! target port.

use super::error::ProxyError;
use super::route::full_body;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, HOST, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use tracing::{debug, warn};

/// Forward an HTTP request to the backend listening on `port`.
pub async fn bridge(
    req: Request<Incoming>,
    port: u16,
    client: &Client<HttpConnector, Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let req = rewrite_request(req, port)?;

    match client.request(req).await {
        Ok(response) => {
            debug!("Backend on port {} answered {}", port, response.status());
            Ok(response.map(|body| body.boxed()))
        }
        Err(e) => {
            warn!("Backend on port {} unreachable: {}", port, e);
            Ok(bad_gateway_response(port, &e)?)
        }
    }
}

/// Retarget the request at `localhost:<port>`, preserving path and query.
fn rewrite_request(
    req: Request<Incoming>,
    port: u16,
) -> Result<Request<Incoming>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    parts.uri = format!("http://localhost:{}{}", port, path_and_query)
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidConnect(format!("Bad rewritten URI: {}", e)))?;

    parts.headers.remove(IF_NONE_MATCH);
    parts.headers.remove(IF_MODIFIED_SINCE);
    parts.headers.remove(CONNECTION);

    let host_value = HeaderValue::from_str(&format!("localhost:{}", port))
        .map_err(|e| ProxyError::InvalidConnect(format!("Bad host header: {}", e)))?;
    parts.headers.insert(HOST, host_value);

    Ok(Request::from_parts(parts, body))
}

/// 502 with a plaintext body naming the failed port.
fn bad_gateway_response(
    port: u16,
    cause: &dyn std::fmt::Display,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    Ok(Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header("Content-Type", "text/plain")
        .body(full_body(format!(
            "Could not reach backend on port {}: {}\n",
            port, cause
        )))?)
}
