//! The proxy server: TCP accept loop and per-connection HTTP serving.
//!
//! The server listens on `127.0.0.1:<port>` (port `0` yields an OS-assigned
//! ephemeral port, discoverable via [`ProxyServer::local_port`]). Each
//! accepted connection is served by hyper's HTTP/1.1 connection driver with
//! upgrade support, dispatching every request through the router. Shutdown
//! is signalled over a watch channel.

use super::error::ProxyError;
use super::route;
use super::tls::MitmEngine;
use crate::registry::ServiceCache;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shared state handed to every connection handler.
pub struct AppState {
    /// Service discovery cache.
    pub services: Arc<ServiceCache>,
    /// TLS interception engine; `None` when no root CA was found, which
    /// disables MITM but nothing else.
    pub mitm: Option<Arc<MitmEngine>>,
    /// Backend HTTP client shared by every bridged request, so keep-alive
    /// connections to backends are pooled instead of re-dialled per request.
    pub backend_client: Client<HttpConnector, Incoming>,
    /// Bound listen port, filled in once the listener exists.
    listen_port: AtomicU16,
}

impl AppState {
    /// Create the shared state.
    pub fn new(services: Arc<ServiceCache>, mitm: Option<Arc<MitmEngine>>) -> Self {
        Self {
            services,
            mitm,
            backend_client: Client::builder(TokioExecutor::new()).build_http(),
            listen_port: AtomicU16::new(0),
        }
    }

    /// The port the proxy is listening on.
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }
}

/// The main proxy server.
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<AppState>,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listen socket on loopback.
    ///
    /// Binding is the only process-fatal failure in the proxy; everything
    /// after this degrades per connection.
    pub async fn bind(
        port: u16,
        state: Arc<AppState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| ProxyError::Bind { port, source })?;

        let bound = listener.local_addr()?.port();
        state.listen_port.store(bound, Ordering::Relaxed);
        info!("Proxy listening on 127.0.0.1:{}", bound);

        Ok(Self {
            listener,
            state,
            shutdown_rx,
        })
    }

    /// The bound port (meaningful when the configured port was 0).
    pub fn local_port(&self) -> u16 {
        self.state.listen_port()
    }

    /// Run the accept loop until the shutdown signal fires.
    pub async fn run(self) -> Result<(), ProxyError> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Spawn a task to handle a single connection.
    fn spawn_connection_handler(&self, stream: TcpStream) {
        let state = self.state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                // Connection resets and silent closes are routine here.
                let err_str = e.to_string();
                if is_silent_close(&e)
                    || err_str.contains("connection reset")
                    || err_str.contains("broken pipe")
                    || err_str.contains("Connection reset")
                {
                    debug!("Connection ended: {}", e);
                } else {
                    warn!("Connection error: {}", e);
                }
            }
        });
    }
}

/// Whether an error is a deliberate silent close.
///
/// A `SilentClose` returned by the router comes back from hyper's connection
/// driver wrapped in a `hyper::Error`, so the whole source chain is walked.
fn is_silent_close(err: &(dyn std::error::Error + 'static)) -> bool {
    if matches!(err.downcast_ref::<ProxyError>(), Some(ProxyError::SilentClose)) {
        return true;
    }
    err.source().map_or(false, is_silent_close)
}

/// Handle a single client connection.
async fn handle_connection(stream: TcpStream, state: Arc<AppState>) -> Result<(), ProxyError> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| route::handle(req, state.clone()));

    // HTTP/1.1 with upgrade support (CONNECT and WebSocket).
    http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryError, ServiceEntry, ServiceScanner};
    use std::time::Duration;

    struct EmptyScanner;

    impl ServiceScanner for EmptyScanner {
        fn scan(&self) -> Result<Vec<ServiceEntry>, RegistryError> {
            Ok(Vec::new())
        }
    }

    fn test_state() -> Arc<AppState> {
        let cache = Arc::new(ServiceCache::new(
            Arc::new(EmptyScanner),
            Duration::from_secs(5),
        ));
        Arc::new(AppState::new(cache, None))
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port_is_discoverable() {
        let (_, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::bind(0, test_state(), shutdown_rx).await.unwrap();
        assert_ne!(server.local_port(), 0);
    }

    #[tokio::test]
    async fn test_bind_records_port_in_state() {
        let (_, shutdown_rx) = watch::channel(false);
        let state = test_state();
        let server = ProxyServer::bind(0, state.clone(), shutdown_rx).await.unwrap();
        assert_eq!(state.listen_port(), server.local_port());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let (_, shutdown_rx) = watch::channel(false);
        let first = ProxyServer::bind(0, test_state(), shutdown_rx.clone())
            .await
            .unwrap();
        let port = first.local_port();

        let second = ProxyServer::bind(port, test_state(), shutdown_rx).await;
        assert!(matches!(second, Err(ProxyError::Bind { .. })));
    }

    #[test]
    fn test_silent_close_detected_directly() {
        assert!(is_silent_close(&ProxyError::SilentClose));
        assert!(!is_silent_close(&ProxyError::InvalidConnect("bad".into())));
    }

    #[test]
    fn test_silent_close_detected_through_source_chain() {
        // Same shape as hyper wrapping the service's error.
        #[derive(Debug, thiserror::Error)]
        #[error("connection driver failed")]
        struct Driver(#[source] ProxyError);

        assert!(is_silent_close(&Driver(ProxyError::SilentClose)));
        assert!(!is_silent_close(&Driver(ProxyError::InvalidConnect(
            "bad".into()
        ))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::bind(0, test_state(), shutdown_rx).await.unwrap();

        let handle = tokio::spawn(server.run());
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }
}
