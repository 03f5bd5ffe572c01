//! TTL-cached service mapping with single-flighted refresh.
//!
//! The router reads an immutable `ServiceMapping` snapshot on every request.
//! When a reader finds the snapshot stale (older than the TTL) it triggers a
//! refresh; concurrent staleness detections collapse into one scan by
//! awaiting a shared refresh gate and re-checking freshness after acquiring
//! it. Scan failures keep the previous mapping so the request path never sees
//! a registry error.

use super::error::RegistryError;
use super::scanner::{ServiceEntry, ServiceScanner};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An immutable snapshot of the discovered services.
///
/// Replaced wholesale on refresh, never mutated entry-by-entry.
#[derive(Debug, Clone)]
pub struct ServiceMapping {
    entries: HashMap<String, ServiceEntry>,
    /// `None` means never scanned, which is always stale.
    scanned_at: Option<Instant>,
}

impl ServiceMapping {
    /// The empty, never-scanned mapping used at startup.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
            scanned_at: None,
        }
    }

    /// Build a mapping from scan results.
    ///
    /// Duplicate names resolve to the most recently started process,
    /// approximated by the highest pid.
    pub fn from_entries(entries: Vec<ServiceEntry>) -> Self {
        let mut map: HashMap<String, ServiceEntry> = HashMap::new();
        for entry in entries {
            match map.get(&entry.name) {
                Some(existing) if existing.pid >= entry.pid => {}
                _ => {
                    map.insert(entry.name.clone(), entry);
                }
            }
        }
        Self {
            entries: map,
            scanned_at: Some(Instant::now()),
        }
    }

    /// Resolve a service name (case-sensitive) to its port.
    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.entries.get(name).map(|entry| entry.port)
    }

    /// All entries, sorted by name.
    pub fn entries(&self) -> Vec<ServiceEntry> {
        let mut list: Vec<ServiceEntry> = self.entries.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Number of known services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        match self.scanned_at {
            Some(at) => at.elapsed() <= ttl,
            None => false,
        }
    }

    fn refreshed(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            scanned_at: Some(Instant::now()),
        }
    }
}

/// TTL cache over a [`ServiceScanner`].
pub struct ServiceCache {
    scanner: Arc<dyn ServiceScanner>,
    ttl: Duration,
    snapshot: RwLock<Arc<ServiceMapping>>,
    /// Single-flight gate: concurrent stale readers queue here and re-check
    /// freshness after acquiring, so N detections become one scan.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl ServiceCache {
    /// Create a cache around a scanner with the given staleness TTL.
    pub fn new(scanner: Arc<dyn ServiceScanner>, ttl: Duration) -> Self {
        Self {
            scanner,
            ttl,
            snapshot: RwLock::new(Arc::new(ServiceMapping::empty())),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Current mapping snapshot, refreshing first if stale.
    pub async fn current(&self) -> Arc<ServiceMapping> {
        {
            let snap = self.snapshot.read().unwrap();
            if snap.is_fresh(self.ttl) {
                return snap.clone();
            }
        }

        let _gate = self.refresh_gate.lock().await;

        // Another reader may have refreshed while we waited for the gate.
        {
            let snap = self.snapshot.read().unwrap();
            if snap.is_fresh(self.ttl) {
                return snap.clone();
            }
        }

        let scanner = self.scanner.clone();
        let result = tokio::task::spawn_blocking(move || scanner.scan()).await;

        let new_snap = match result {
            Ok(Ok(entries)) => {
                debug!("Service scan found {} service(s)", entries.len());
                Arc::new(ServiceMapping::from_entries(entries))
            }
            Ok(Err(e)) => {
                warn!("Service scan failed: {}; keeping previous mapping", e);
                let previous = self.snapshot.read().unwrap().clone();
                Arc::new(previous.refreshed())
            }
            Err(e) => {
                warn!("Service scan task failed: {}; keeping previous mapping", e);
                let previous = self.snapshot.read().unwrap().clone();
                Arc::new(previous.refreshed())
            }
        };

        *self.snapshot.write().unwrap() = new_snap.clone();
        new_snap
    }

    /// Dashboard listing: all services sorted by name.
    pub async fn list(&self) -> Vec<ServiceEntry> {
        self.current().await.entries()
    }

    /// Resolve a service name to its port via the current snapshot.
    pub async fn resolve(&self, name: &str) -> Option<u16> {
        self.current().await.port_of(name)
    }
}

/// Convenience error alias re-exported for scanner implementors.
pub type ScanResult = Result<Vec<ServiceEntry>, RegistryError>;
