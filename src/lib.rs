//! namedock: reach local dev servers by name instead of port
//!
//! This crate implements a developer-machine proxy daemon. Processes declare
//! a service name by running with `NAMEDOCK_NAME=<name>` in their
//! environment; the proxy discovers them and makes each reachable at
//! `http://<name>.localhost` through three traffic shapes: subdomain
//! reverse-proxying, forward-proxy requests (absolute-URI and CONNECT), and
//! WebSocket upgrades. CONNECT tunnels on port 443 are TLS-intercepted with
//! leaf certificates signed by a locally trusted root CA (e.g. mkcert's) so
//! name-based routing works inside HTTPS too.
//!
//! # Architecture
//!
//! - **Registry**: `/proc`-based service discovery behind a TTL cache
//! - **Proxy**: connection router, HTTP/WebSocket bridges, CONNECT tunnels
//! - **CA**: root CA lookup and per-hostname leaf issuance
//! - **Dashboard**: HTML service listing served at `http://localhost:<port>`

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod ca;
pub mod cli;
pub mod config;
pub mod dashboard;
pub mod proxy;
pub mod registry;
