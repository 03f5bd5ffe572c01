//! The proxy engine: routing, protocol bridging, and TLS interception.
//!
//! This module provides the connection-handling core:
//! - Subdomain reverse-proxying (`name.localhost` → local service port)
//! - Forward-proxy handling of absolute-URI requests
//! - HTTP CONNECT tunnels, raw or TLS-intercepted with per-hostname leaf
//!   certificates
//! - WebSocket upgrade bridging to backend services
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌────────────────────────────────────────────┐
//! │  Browser │────▶│ ProxyServer (127.0.0.1:2000)               │
//! └──────────┘     │   route::handle                            │
//!                  │    ├─ dashboard      (localhost)           │
//!                  │    ├─ http::bridge   (name.localhost)      │
//!                  │    ├─ websocket      (Upgrade: websocket)  │
//!                  │    └─ connect        (CONNECT host:443)    │
//!                  │         └─ MitmEngine ──▶ route::handle    │
//!                  └────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//!                        localhost:<service port>
//! ```
//!
//! # Example
//!
//! ```ignore
//! use namedock::proxy::{AppState, ProxyServer};
//! use namedock::registry::{ProcScanner, ServiceCache};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let services = Arc::new(ServiceCache::new(
//!     Arc::new(ProcScanner::new()),
//!     Duration::from_secs(5),
//! ));
//! let state = Arc::new(AppState::new(services, None));
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::bind(2000, state, shutdown_rx).await?;
//! server.run().await?;
//! ```

pub mod connect;
pub mod error;
pub mod http;
pub mod route;
pub mod server;
pub mod tls;
pub mod websocket;

// Re-export main types for convenient access
pub use error::{ProxyError, ProxyResult};
pub use server::{AppState, ProxyServer};
pub use tls::MitmEngine;
