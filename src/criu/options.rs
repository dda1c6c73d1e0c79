//! Page transfer options - global configuration for dump and page-server runs.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Result, XferError};

/// Default bound on waiting for page bytes that are still in flight.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(10);

/// Global options instance - initialized once at startup, read everywhere.
pub static OPTS: OnceLock<XferOpts> = OnceLock::new();

/// Initialize the global options.
pub fn opts_init(opts: XferOpts) -> std::result::Result<(), XferOpts> {
    OPTS.set(opts)
}

/// Get reference to global options. Panics if not initialized.
pub fn opts() -> &'static XferOpts {
    OPTS.get().expect("OPTS not initialized")
}

/// Get reference to global options, returning None if not initialized.
pub fn opts_try() -> Option<&'static XferOpts> {
    OPTS.get()
}

#[derive(Debug, Clone)]
pub struct XferOpts {
    /// Send pages to a remote page server instead of local images.
    pub use_page_server: bool,
    pub addr: Option<String>,
    pub port: u16,
    pub imgs_dir: PathBuf,
    pub relay_timeout: Duration,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for XferOpts {
    fn default() -> Self {
        Self {
            use_page_server: false,
            addr: None,
            port: 0,
            imgs_dir: PathBuf::from("."),
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            verbose: false,
            log_file: None,
        }
    }
}

impl XferOpts {
    /// Page server address for the listening side. A missing address binds
    /// every interface.
    pub fn ps_bind_addr(&self) -> Result<SocketAddrV4> {
        let ip = match &self.addr {
            Some(a) => parse_ipv4(a)?,
            None => Ipv4Addr::UNSPECIFIED,
        };
        Ok(SocketAddrV4::new(ip, self.port))
    }

    /// Page server address for the dumping side. Both address and port are
    /// required.
    pub fn ps_addr(&self) -> Result<SocketAddrV4> {
        let addr = self
            .addr
            .as_deref()
            .ok_or_else(|| XferError::Config("page server address not set".to_string()))?;
        if self.port == 0 {
            return Err(XferError::Config("page server port not set".to_string()));
        }
        Ok(SocketAddrV4::new(parse_ipv4(addr)?, self.port))
    }
}

fn parse_ipv4(addr: &str) -> Result<Ipv4Addr> {
    addr.parse()
        .map_err(|_| XferError::Config(format!("bad page server address {}", addr)))
}
