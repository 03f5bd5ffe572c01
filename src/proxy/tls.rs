//! TLS interception for MITM'd CONNECT tunnels.
//!
//! This module provides:
//! - A leaf certificate cache keyed by hostname (no eviction; entries live
//!   for the process lifetime)
//! - Dynamic certificate resolution using SNI, with the CONNECT target as a
//!   hint for SNI-less clients
//! - In-place TLS termination of the upgraded tunnel stream, after which the
//!   decrypted requests feed back through the normal router
//!
//! # Critical ALPN Note
//!
//! We **must** force HTTP/1.1 via ALPN. If we allow HTTP/2 negotiation,
//! modern clients (curl, browsers, SDKs) will upgrade to H2 after the TLS
//! handshake, and the single-request bridges behind the router only speak
//! HTTP/1.1 framing.

use super::error::ProxyError;
use super::route;
use super::server::AppState;
use crate::ca::CertificateAuthority;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use hyper::server::conn::http1;
use hyper::Response;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, trace};

/// TLS interception engine: leaf cache plus termination plumbing.
pub struct MitmEngine {
    ca: Arc<CertificateAuthority>,
    /// Cache of hostname -> certified key.
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl MitmEngine {
    /// Create an engine around a loaded root CA.
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get or issue a certified key for the given hostname.
    ///
    /// Concurrent first requests for the same unseen hostname may both
    /// issue; the insert is first-writer-wins, so exactly one entry remains
    /// cached and every caller gets a certificate the client will accept.
    pub fn get_or_issue(&self, hostname: &str) -> Result<Arc<CertifiedKey>, ProxyError> {
        let hostname_lower = hostname.to_lowercase();

        {
            let cache = self.cache.read().unwrap();
            if let Some(key) = cache.get(&hostname_lower) {
                trace!("Leaf certificate cache hit for {}", hostname);
                return Ok(key.clone());
            }
        }

        debug!("Issuing leaf certificate for {}", hostname);

        let leaf = self.ca.issue_leaf(&hostname_lower)?;

        let cert_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ProxyError::Tls(format!("Failed to parse leaf PEM: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(ProxyError::Tls("No certificates found in leaf PEM".into()));
        }

        let private_key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
                .map_err(|e| ProxyError::Tls(format!("Failed to parse leaf key PEM: {}", e)))?
                .ok_or_else(|| ProxyError::Tls("No private key found in leaf PEM".into()))?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
            .map_err(|e| ProxyError::Tls(format!("Failed to create signing key: {}", e)))?;

        let certified_key = Arc::new(CertifiedKey::new(cert_chain, signing_key));

        let mut cache = self.cache.write().unwrap();
        let entry = cache
            .entry(hostname_lower)
            .or_insert_with(|| certified_key.clone());
        Ok(entry.clone())
    }

    /// Number of cached leaf certificates.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    /// Whether the leaf cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.read().unwrap().is_empty()
    }

    /// Build a TLS acceptor presenting leaves resolved by SNI, falling back
    /// to the CONNECT target hostname for SNI-less clients.
    pub fn acceptor(self: &Arc<Self>, hint: &str) -> TlsAcceptor {
        let resolver: Arc<dyn ResolvesServerCert> = Arc::new(LeafResolver {
            engine: self.clone(),
            hint: hint.to_string(),
        });

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);

        // Force HTTP/1.1; an H2 upgrade would bypass the per-request router.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        TlsAcceptor::from(Arc::new(config))
    }

    /// Terminate TLS on an upgraded CONNECT stream and serve the decrypted
    /// requests through the router.
    pub async fn terminate(
        self: &Arc<Self>,
        upgraded: Upgraded,
        hostname: &str,
        state: Arc<AppState>,
    ) -> Result<(), ProxyError> {
        let acceptor = self.acceptor(hostname);

        let tls_stream = acceptor
            .accept(TokioIo::new(upgraded))
            .await
            .map_err(|e| ProxyError::Tls(format!("Client TLS handshake failed: {}", e)))?;

        debug!("TLS established inside tunnel for {}", hostname);

        let io = TokioIo::new(tls_stream);
        // Boxing erases the handler's future type; routing recurses through
        // here for intercepted tunnels.
        let service = service_fn(
            move |req| -> BoxFuture<'static, Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError>> {
                Box::pin(route::handle(req, state.clone()))
            },
        );

        http1::Builder::new()
            .preserve_header_case(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(ProxyError::from)
    }
}

/// Certificate resolver that issues leaves on demand.
struct LeafResolver {
    engine: Arc<MitmEngine>,
    /// Hostname from the CONNECT target, used when the client omits SNI.
    hint: String,
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = client_hello
            .server_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.hint.clone());

        trace!("Resolving leaf certificate for: {}", hostname);

        match self.engine.get_or_issue(&hostname) {
            Ok(key) => Some(key),
            Err(e) => {
                error!("Failed to issue leaf for {}: {}", hostname, e);
                None
            }
        }
    }
}

// Required for Arc<LeafResolver> to implement ResolvesServerCert.
impl std::fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafResolver")
            .field("hint", &self.hint)
            .field("cache_size", &self.engine.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
        KeyUsagePurpose,
    };
    use time::{Duration, OffsetDateTime};

    fn test_engine() -> Arc<MitmEngine> {
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
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(1);
        let cert = params.self_signed(&key).unwrap();

        let ca =
            CertificateAuthority::from_pem(&cert.pem(), &key.serialize_pem()).unwrap();
        Arc::new(MitmEngine::new(Arc::new(ca)))
    }

    #[test]
    fn test_leaf_issuance_and_caching() {
        let engine = test_engine();

        let key1 = engine.get_or_issue("web.localhost").unwrap();
        assert_eq!(engine.len(), 1);

        let key2 = engine.get_or_issue("web.localhost").unwrap();
        assert_eq!(engine.len(), 1);

        assert!(Arc::ptr_eq(&key1, &key2));
    }

    #[test]
    fn test_leaf_cache_case_insensitive() {
        let engine = test_engine();

        engine.get_or_issue("web.localhost").unwrap();
        engine.get_or_issue("WEB.LOCALHOST").unwrap();
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_distinct_hostnames_get_distinct_entries() {
        let engine = test_engine();

        engine.get_or_issue("alpha.localhost").unwrap();
        engine.get_or_issue("beta.localhost").unwrap();
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn test_acceptor_creation() {
        let engine = test_engine();
        let _acceptor = engine.acceptor("web.localhost");
    }
}
