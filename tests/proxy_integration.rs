//! End-to-end tests driving a real proxy listener over loopback sockets.
//!
//! The registry is faked so tests control the name -> port mapping; backends
//! are real hyper/tungstenite servers on ephemeral ports.

use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use namedock::ca::CertificateAuthority;
use namedock::proxy::{AppState, MitmEngine, ProxyServer};
use namedock::registry::{RegistryError, ServiceCache, ServiceEntry, ServiceScanner};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

struct FixedScanner {
    entries: Vec<ServiceEntry>,
}

impl ServiceScanner for FixedScanner {
    fn scan(&self) -> Result<Vec<ServiceEntry>, RegistryError> {
        Ok(self.entries.clone())
    }
}

fn entry(name: &str, port: u16) -> ServiceEntry {
    ServiceEntry {
        name: name.to_string(),
        port,
        pid: 4242,
        command: format!("{} --serve", name),
    }
}

/// Start a proxy with a fixed service mapping; returns the bound port and
/// the shutdown handle that must stay alive for the test's duration.
async fn start_proxy(entries: Vec<ServiceEntry>) -> (u16, watch::Sender<bool>) {
    start_proxy_with(entries, None).await
}

async fn start_proxy_with(
    entries: Vec<ServiceEntry>,
    mitm: Option<Arc<MitmEngine>>,
) -> (u16, watch::Sender<bool>) {
    let services = Arc::new(ServiceCache::new(
        Arc::new(FixedScanner { entries }),
        Duration::from_secs(60),
    ));
    let state = Arc::new(AppState::new(services, mitm));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind(0, state, shutdown_rx).await.unwrap();
    let port = server.local_port();
    tokio::spawn(server.run());

    (port, shutdown_tx)
}

/// Self-signed CA for interception tests, as (cert PEM, key PEM).
fn generate_test_ca() -> (String, String) {
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
        KeyUsagePurpose,
    };

    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String("namedock test CA".to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(1);

    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// HTTP backend that echoes the request path, Host header, and whether any
/// conditional headers survived the proxy.
async fn spawn_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    let body = serde_json::json!({
                        "path": req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/"),
                        "host": host,
                        "conditional": req.headers().contains_key("if-none-match")
                            || req.headers().contains_key("if-modified-since"),
                    })
                    .to_string();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    port
}

/// WebSocket backend that echoes every data frame.
async fn spawn_ws_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_close() {
                        break;
                    }
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    port
}

/// HTTP backend that answers 200 and counts accepted TCP connections.
async fn spawn_counting_backend() -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let conns = Arc::new(AtomicUsize::new(0));

    let counter = conns.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let service = service_fn(|_req: Request<Incoming>| async {
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from("ok"))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (port, conns)
}

/// Raw TCP backend that echoes bytes verbatim.
async fn spawn_tcp_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    port
}

/// Send one HTTP/1.1 request over a fresh connection and read to EOF.
async fn raw_request(proxy_port: u16, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    // Read to EOF; tolerate a timeout for responses that leave the
    // connection open, keeping whatever arrived.
    let mut response = Vec::new();
    let _ = tokio::time::timeout(
        Duration::from_secs(5),
        stream.read_to_end(&mut response),
    )
    .await;
    response
}

#[tokio::test]
async fn reverse_proxy_routes_by_subdomain() {
    let backend_port = spawn_echo_backend().await;
    let (proxy_port, _shutdown) = start_proxy(vec![entry("web", backend_port)]).await;

    let response = raw_request(
        proxy_port,
        "GET /hello?x=1 HTTP/1.1\r\nHost: web.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("/hello?x=1"));
    // The Host header is rewritten to the backend's own address.
    assert!(response.contains(&format!("localhost:{}", backend_port)));
}

#[tokio::test]
async fn conditional_headers_are_stripped() {
    let backend_port = spawn_echo_backend().await;
    let (proxy_port, _shutdown) = start_proxy(vec![entry("web", backend_port)]).await;

    let response = raw_request(
        proxy_port,
        "GET / HTTP/1.1\r\nHost: web.localhost\r\nIf-None-Match: \"abc\"\r\n\
         If-Modified-Since: Tue, 01 Jan 2030 00:00:00 GMT\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"conditional\":false"));
}

#[tokio::test]
async fn unknown_subdomain_gets_404() {
    let (proxy_port, _shutdown) = start_proxy(vec![]).await;

    let response = raw_request(
        proxy_port,
        "GET / HTTP/1.1\r\nHost: ghost.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.contains("ghost"));
}

#[tokio::test]
async fn dead_backend_gets_502_naming_port() {
    // Bind then drop a listener so the port is very likely unoccupied.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (proxy_port, _shutdown) = start_proxy(vec![entry("web", dead_port)]).await;

    let response = raw_request(
        proxy_port,
        "GET / HTTP/1.1\r\nHost: web.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 502"));
    assert!(response.contains(&dead_port.to_string()));
}

#[tokio::test]
async fn dashboard_lists_services() {
    let (proxy_port, _shutdown) = start_proxy(vec![entry("web", 4000)]).await;

    let response = raw_request(
        proxy_port,
        "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("text/html"));
    assert!(response.contains(&format!("http://web.localhost:{}/", proxy_port)));
}

#[tokio::test]
async fn dashboard_renders_empty_state() {
    let (proxy_port, _shutdown) = start_proxy(vec![]).await;

    let response = raw_request(
        proxy_port,
        "GET / HTTP/1.1\r\nHost: _.localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("No services found"));
}

#[tokio::test]
async fn unmapped_forward_request_closes_silently() {
    let (proxy_port, _shutdown) = start_proxy(vec![]).await;

    let response = raw_request(
        proxy_port,
        "GET http://nosuch/ HTTP/1.1\r\nHost: nosuch\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.is_empty(), "expected zero bytes, got {:?}", response);
}

#[tokio::test]
async fn mapped_forward_request_is_proxied() {
    let backend_port = spawn_echo_backend().await;
    let (proxy_port, _shutdown) = start_proxy(vec![entry("api", backend_port)]).await;

    let response = raw_request(
        proxy_port,
        "GET http://api/ping HTTP/1.1\r\nHost: api\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("/ping"));
}

#[tokio::test]
async fn connect_to_unreachable_target_writes_zero_bytes() {
    let (proxy_port, _shutdown) = start_proxy(vec![]).await;

    let response = raw_request(
        proxy_port,
        "CONNECT unknown.invalid:9999 HTTP/1.1\r\nHost: unknown.invalid:9999\r\n\r\n",
    )
    .await;

    assert!(response.is_empty(), "expected zero bytes, got {:?}", response);
}

#[tokio::test]
async fn connect_pipes_bytes_to_live_target() {
    let echo_port = spawn_tcp_echo_backend().await;
    let (proxy_port, _shutdown) = start_proxy(vec![]).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
                port = echo_port
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    // Read the 200 reply up to the blank line.
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        header.push(byte[0]);
    }
    assert!(String::from_utf8_lossy(&header).starts_with("HTTP/1.1 200"));

    // The tunnel is now an opaque pipe to the echo server.
    stream.write_all(b"ping through tunnel").await.unwrap();
    let mut echoed = [0u8; 19];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping through tunnel");
}

#[tokio::test]
async fn websocket_roundtrip_through_proxy() {
    let ws_port = spawn_ws_echo_backend().await;
    let (proxy_port, _shutdown) = start_proxy(vec![entry("ws", ws_port)]).await;

    let stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let (mut ws, response) =
        tokio_tungstenite::client_async("ws://ws.localhost/echo", stream)
            .await
            .unwrap();
    assert_eq!(response.status(), 101);

    ws.send(Message::Text("hello bridge".to_string()))
        .await
        .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Text("hello bridge".to_string()));

    ws.send(Message::Binary(vec![0x01, 0x02, 0xff]))
        .await
        .unwrap();
    let echoed = ws.next().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Binary(vec![0x01, 0x02, 0xff]));

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn websocket_to_dead_backend_closes_with_1011() {
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (proxy_port, _shutdown) = start_proxy(vec![entry("ws", dead_port)]).await;

    let stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let (mut ws, response) = tokio_tungstenite::client_async("ws://ws.localhost/echo", stream)
        .await
        .unwrap();
    assert_eq!(response.status(), 101);

    let frame = ws.next().await.unwrap().unwrap();
    match frame {
        Message::Close(Some(close)) => assert_eq!(close.code, CloseCode::Error),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn backend_connections_are_pooled_across_requests() {
    let (backend_port, conns) = spawn_counting_backend().await;
    let (proxy_port, _shutdown) = start_proxy(vec![entry("web", backend_port)]).await;

    for _ in 0..2 {
        let response = raw_request(
            proxy_port,
            "GET / HTTP/1.1\r\nHost: web.localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200"));
        // Let the shared client check its connection back into the pool.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(conns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_tunnel_intercepts_tls_for_known_name() {
    let backend_port = spawn_echo_backend().await;

    let (ca_pem, ca_key_pem) = generate_test_ca();
    let ca = CertificateAuthority::from_pem(&ca_pem, &ca_key_pem).unwrap();
    let engine = Arc::new(MitmEngine::new(Arc::new(ca)));
    let (proxy_port, _shutdown) =
        start_proxy_with(vec![entry("testapp", backend_port)], Some(engine)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream
        .write_all(
            b"CONNECT testapp.localhost:443 HTTP/1.1\r\nHost: testapp.localhost:443\r\n\r\n",
        )
        .await
        .unwrap();

    // Read the 200 reply up to the blank line.
    let mut header = Vec::new();
    let mut byte = [0u8; 1];
    while !header.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        header.push(byte[0]);
    }
    assert!(String::from_utf8_lossy(&header).starts_with("HTTP/1.1 200"));

    // Handshake with a client that trusts only the test root; rustls
    // verifies the issued leaf's chain and its SAN against the server name.
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name =
        rustls_pki_types::ServerName::try_from("testapp.localhost".to_string()).unwrap();
    let mut tls = connector.connect(server_name, stream).await.unwrap();

    // Inside the decrypted tunnel, routing works exactly as in plaintext.
    tls.write_all(
        b"GET /secure HTTP/1.1\r\nHost: testapp.localhost\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), tls.read_to_end(&mut response)).await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("/secure"));
    assert!(response.contains(&format!("localhost:{}", backend_port)));
}

#[tokio::test]
async fn websocket_upgrade_without_key_gets_400() {
    let ws_port = spawn_ws_echo_backend().await;
    let (proxy_port, _shutdown) = start_proxy(vec![entry("ws", ws_port)]).await;

    let response = raw_request(
        proxy_port,
        "GET /echo HTTP/1.1\r\nHost: ws.localhost\r\nUpgrade: websocket\r\n\
         Connection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .await;
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 400"));
}
