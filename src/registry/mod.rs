//! Service discovery and the name → port mapping cache.
//!
//! Services self-declare by running with `NAMEDOCK_NAME=<name>` in their
//! environment. The [`ServiceScanner`] trait is the discovery contract; the
//! [`ProcScanner`] walks `/proc` on Linux, and [`ServiceCache`] turns scan
//! results into TTL-cached immutable snapshots consumed by the router.

pub mod cache;
pub mod error;
pub mod scanner;

pub use cache::{ScanResult, ServiceCache, ServiceMapping};
pub use error::RegistryError;
pub use scanner::{ProcScanner, ServiceEntry, ServiceScanner, SERVICE_NAME_ENV};
