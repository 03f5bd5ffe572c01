//! Command-line interface definitions for namedock.
//!
//! Uses clap's derive API for type-safe argument parsing.

use crate::config;
use clap::Parser;
use std::path::PathBuf;

/// Local developer proxy that routes `name.localhost` traffic to services.
///
/// namedock discovers locally running processes that declare a service name
/// via the NAMEDOCK_NAME environment variable and proxies browser traffic to
/// them by name: plain HTTP, WebSocket upgrades, and CONNECT-tunneled HTTPS
/// (decrypted with a locally trusted root CA such as mkcert's).
#[derive(Parser, Debug)]
#[command(name = "namedock")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Port to listen on. 0 picks an OS-assigned ephemeral port.
    #[arg(
        short = 'p',
        long = "port",
        env = config::PORT_ENV,
        default_value_t = config::DEFAULT_PORT,
        value_name = "PORT"
    )]
    pub port: u16,

    /// Directory containing rootCA.pem and rootCA-key.pem.
    ///
    /// Overrides the automatic lookup (mkcert -CAROOT, then mkcert's
    /// per-platform default directories). Without a usable CA, HTTPS
    /// interception is disabled and everything else keeps working.
    #[arg(long = "ca-root", env = config::CA_ROOT_ENV, value_name = "DIR")]
    pub ca_root: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
