//! Service discovery by inspecting `/proc`.
//!
//! A process declares itself as a named service by running with the
//! `NAMEDOCK_NAME` environment variable set. The scanner finds every such
//! process that holds a listening TCP socket:
//!
//! 1. Collect listening sockets (with their inode numbers) from
//!    `/proc/net/tcp` and `/proc/net/tcp6`.
//! 2. For each process directory in `/proc`, read `environ` and keep only
//!    processes that carry `NAMEDOCK_NAME`.
//! 3. Match the process to its sockets via the `socket:[inode]` symlinks in
//!    `/proc/<pid>/fd`.
//!
//! Scanning BOTH tcp and tcp6 matters: modern dev servers (Node, Vite,
//! Python's http.server) often bind to `::` by default and would be invisible
//! to an IPv4-only scan.

use super::error::RegistryError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::trace;

/// Environment variable a process sets to declare its service name.
pub const SERVICE_NAME_ENV: &str = "NAMEDOCK_NAME";

/// A discovered local service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    /// Self-declared service name (case-sensitive).
    pub name: String,
    /// Port the service is listening on.
    pub port: u16,
    /// Process id of the service.
    pub pid: u32,
    /// Command line of the process, space-joined.
    pub command: String,
}

/// The consumed discovery contract.
///
/// `scan` may be slow (it walks OS process and socket tables); the cache
/// calls it off the async runtime via `spawn_blocking` and never lets a
/// failure reach the request path.
pub trait ServiceScanner: Send + Sync {
    /// Enumerate the currently running named services.
    fn scan(&self) -> Result<Vec<ServiceEntry>, RegistryError>;
}

/// `/proc`-based scanner for Linux.
pub struct ProcScanner {
    proc_root: String,
}

impl ProcScanner {
    /// Create a scanner rooted at `/proc`.
    pub fn new() -> Self {
        Self {
            proc_root: "/proc".to_string(),
        }
    }

    /// Create a scanner rooted at an alternate directory (tests).
    #[cfg(test)]
    fn with_root(root: &str) -> Self {
        Self {
            proc_root: root.to_string(),
        }
    }

    /// Collect listening socket inodes and their ports.
    fn listening_sockets(&self) -> Result<HashMap<u64, u16>, RegistryError> {
        let mut sockets = HashMap::new();

        for table in ["net/tcp", "net/tcp6"] {
            let path = format!("{}/{}", self.proc_root, table);
            match fs::read_to_string(&path) {
                Ok(content) => {
                    sockets.extend(parse_proc_net_tcp(&content)?);
                }
                Err(e) => {
                    trace!("Could not read {}: {}", path, e);
                }
            }
        }

        Ok(sockets)
    }
}

impl Default for ProcScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceScanner for ProcScanner {
    fn scan(&self) -> Result<Vec<ServiceEntry>, RegistryError> {
        let sockets = self.listening_sockets()?;
        let mut entries = Vec::new();

        let proc_dir = fs::read_dir(&self.proc_root).map_err(|e| {
            RegistryError::ScanFailed(format!("cannot read {}: {}", self.proc_root, e))
        })?;

        for dir in proc_dir.flatten() {
            let pid: u32 = match dir.file_name().to_str().and_then(|n| n.parse().ok()) {
                Some(pid) => pid,
                None => continue,
            };

            // Unreadable entries belong to other users or raced with process
            // exit; skip them.
            let environ = match fs::read(dir.path().join("environ")) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let name = match environ_value(&environ, SERVICE_NAME_ENV) {
                Some(name) if !name.is_empty() => name,
                _ => continue,
            };

            let port = match lowest_listening_port(&dir.path(), &sockets) {
                Some(port) => port,
                None => continue,
            };

            let command = fs::read(dir.path().join("cmdline"))
                .map(|bytes| cmdline_string(&bytes))
                .unwrap_or_default();

            trace!("Discovered service '{}' on port {} (pid {})", name, port, pid);
            entries.push(ServiceEntry {
                name,
                port,
                pid,
                command,
            });
        }

        Ok(entries)
    }
}

/// Parse `/proc/net/tcp` or `/proc/net/tcp6` into `inode -> port` for
/// sockets in LISTEN state.
///
/// Format (each line after the header):
/// ```text
///    sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
///    0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 ...
/// ```
fn parse_proc_net_tcp(content: &str) -> Result<HashMap<u64, u16>, RegistryError> {
    let mut sockets = HashMap::new();

    for line in content.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 10 {
            continue;
        }

        // State 0A = LISTEN.
        let state = u8::from_str_radix(parts[3], 16)
            .map_err(|_| RegistryError::ParseError(format!("Invalid state: {}", parts[3])))?;
        if state != 0x0A {
            continue;
        }

        // Port is the hex suffix of the local address, network byte order.
        let port_hex = parts[1].rsplit(':').next().ok_or_else(|| {
            RegistryError::ParseError(format!("Invalid local address: {}", parts[1]))
        })?;
        let port = u16::from_str_radix(port_hex, 16)
            .map_err(|_| RegistryError::ParseError(format!("Invalid port: {}", port_hex)))?;

        let inode: u64 = parts[9]
            .parse()
            .map_err(|_| RegistryError::ParseError(format!("Invalid inode: {}", parts[9])))?;

        sockets.insert(inode, port);
    }

    Ok(sockets)
}

/// Look up the value of `key` in a NUL-separated environ blob.
fn environ_value(environ: &[u8], key: &str) -> Option<String> {
    let prefix = format!("{}=", key);
    environ
        .split(|b| *b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .find_map(|entry| entry.strip_prefix(&prefix))
        .map(|value| value.to_string())
}

/// Join a NUL-separated cmdline blob with spaces.
fn cmdline_string(cmdline: &[u8]) -> String {
    cmdline
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve the lowest listening port owned by the process at `pid_dir`.
///
/// A process may hold several listening sockets (e.g. an HTTP port and a
/// debug port); the lowest one is the service's canonical port.
fn lowest_listening_port(pid_dir: &Path, sockets: &HashMap<u64, u16>) -> Option<u16> {
    let fds = fs::read_dir(pid_dir.join("fd")).ok()?;
    let mut lowest = None;

    for fd in fds.flatten() {
        let target = match fs::read_link(fd.path()) {
            Ok(target) => target,
            Err(_) => continue,
        };
        let target = target.to_string_lossy();
        let inode: u64 = match target
            .strip_prefix("socket:[")
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|inode| inode.parse().ok())
        {
            Some(inode) => inode,
            None => continue,
        };
        if let Some(port) = sockets.get(&inode) {
            lowest = Some(lowest.map_or(*port, |low: u16| low.min(*port)));
        }
    }

    lowest
}
