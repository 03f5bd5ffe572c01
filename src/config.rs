//! Process-wide configuration constants.

use std::time::Duration;

/// Default listening port for the proxy daemon.
pub const DEFAULT_PORT: u16 = 2000;

/// Environment variable overriding the listening port.
pub const PORT_ENV: &str = "NAMEDOCK_PORT";

/// Environment variable overriding the root CA directory.
pub const CA_ROOT_ENV: &str = "NAMEDOCK_CA_ROOT";

/// How long a service-mapping snapshot stays fresh before the next request
/// triggers a rescan.
pub const REGISTRY_TTL: Duration = Duration::from_secs(5);
