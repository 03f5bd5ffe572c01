//! WebSocket bridge: pair a client upgrade with a backend connection and
//! forward frames both ways.
//!
//! A client-role connection to `ws://localhost:<port><path><query>` is opened
//! before the handshake is answered (101 plus the derived accept key), so the
//! backend is already connected by the time the client can send its first
//! frame; nothing is ever queued or dropped while waiting for the backend. A
//! failed backend dial still answers 101 and immediately closes the client
//! with 1011. Once both ends are open, two pump loops forward frames until
//! either side closes; the two directions fate-share, and a transport error
//! closes the peer with 1011.

use super::error::ProxyError;
use super::route::{empty_body, full_body};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type BackendWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Whether the request asks for a WebSocket upgrade.
pub fn is_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Answer the upgrade handshake and spawn the bridging task.
///
/// A request without `Sec-WebSocket-Key` gets a 400; negotiation never
/// silently degrades to plain HTTP. The backend dial completes before the
/// 101 goes out, so a frame the client fires immediately after the
/// handshake always has a connected backend waiting for it.
pub async fn handle_upgrade(
    req: Request<Incoming>,
    port: u16,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
    let key = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) => key.clone(),
        None => {
            warn!("WebSocket upgrade without Sec-WebSocket-Key");
            return Ok(Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .header("Content-Type", "text/plain")
                .body(full_body(
                    "Malformed WebSocket upgrade: missing Sec-WebSocket-Key\n".to_string(),
                ))?);
        }
    };
    let accept = derive_accept_key(key.as_bytes());
    let protocol = req.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let backend_url = format!("ws://localhost:{}{}", port, path_and_query);

    debug!("Connecting backend WebSocket {}", backend_url);
    let backend = match connect_async(backend_url.as_str()).await {
        Ok((ws, _)) => Some(ws),
        Err(e) => {
            warn!("Backend WebSocket {} unreachable: {}", backend_url, e);
            None
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = bridge(upgraded, backend, &backend_url).await {
                    debug!("WebSocket bridge ended: {}", e);
                }
            }
            Err(e) => {
                warn!("WebSocket upgrade failed: {}", e);
            }
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = protocol {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    Ok(builder.body(empty_body())?)
}

/// Bridge the upgraded client stream to an already-dialled backend.
async fn bridge(
    upgraded: Upgraded,
    backend: Option<BackendWs>,
    backend_url: &str,
) -> Result<(), ProxyError> {
    let mut client_ws =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

    let Some(backend_ws) = backend else {
        let _ = client_ws
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Error,
                reason: "backend websocket connection failed".into(),
            })))
            .await;
        return Ok(());
    };

    debug!("WebSocket bridge established to {}", backend_url);

    let (backend_tx, backend_rx) = backend_ws.split();
    let (client_tx, client_rx) = client_ws.split();

    // Either direction ending tears down both.
    tokio::select! {
        _ = pump(client_rx, backend_tx, "client->backend") => {}
        _ = pump(backend_rx, client_tx, "backend->client") => {}
    }

    debug!("WebSocket bridge closed for {}", backend_url);
    Ok(())
}

/// Forward frames from `rx` to `tx` until close or error.
///
/// Close frames propagate with their original code and reason; a transport
/// error closes the peer with 1011.
async fn pump<R, W>(mut rx: R, mut tx: W, direction: &str)
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(next) = rx.next().await {
        match next {
            Ok(Message::Close(frame)) => {
                debug!("WebSocket close received ({})", direction);
                let _ = tx.send(Message::Close(frame)).await;
                break;
            }
            // Raw frames only appear when reading partial messages, which
            // this bridge never requests.
            Ok(Message::Frame(_)) => {}
            Ok(msg) => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("WebSocket transport error ({}): {}", direction, e);
                let _ = tx
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Error,
                        reason: "proxy transport error".into(),
                    })))
                    .await;
                break;
            }
        }
    }
}
