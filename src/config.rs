//! Runtime configuration
//!
//! The deployment mode is fixed at build time by the `production` feature; it
//! picks the defaults below. Individual values can still be overridden from the
//! command line.

use crate::acme::AcmeConfig;
use crate::control::default_control_addr;
use crate::proxy::ProxyConfig;
use crate::routes::default_routes_file;
use crate::takeover::TakeoverPolicy;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Locally generated certificates, logs on stderr
    Development,
    /// ACME certificates for routed domains, logs appended to a file
    Production,
}

impl Mode {
    pub const fn from_build() -> Self {
        if cfg!(feature = "production") {
            Mode::Production
        } else {
            Mode::Development
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Development => "development",
            Mode::Production => "production",
        }
    }
}

/// How development certificates are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CertTool {
    /// mkcert if it is installed, otherwise serve plain HTTP only
    Auto,
    Mkcert,
    SelfSigned,
    /// Serve plain HTTP only
    None,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub control_addr: SocketAddr,
    /// Routes snapshot; `None` keeps routes in memory only
    pub routes_file: Option<PathBuf>,
    /// Development certificates
    pub certs_dir: PathBuf,
    pub cert_tool: CertTool,
    pub acme: AcmeConfig,
    pub renewal_interval: Duration,
    pub takeover: TakeoverPolicy,
    pub proxy: ProxyConfig,
    pub handshake_timeout: Duration,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn for_mode(mode: Mode) -> Self {
        let acme_dir = dirs_next::home_dir()
            .map(|home| home.join("certs"))
            .unwrap_or_else(|| PathBuf::from("certs"));

        Self {
            mode,
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 80)),
            https_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 443)),
            control_addr: default_control_addr(),
            routes_file: default_routes_file(),
            certs_dir: PathBuf::from("certs"),
            cert_tool: CertTool::Auto,
            acme: AcmeConfig::new(acme_dir),
            renewal_interval: Duration::from_secs(12 * 60 * 60),
            takeover: TakeoverPolicy::default(),
            proxy: ProxyConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            log_file: match mode {
                Mode::Development => None,
                Mode::Production => Some(PathBuf::from("logs/core.log")),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::for_mode(Mode::from_build())
    }
}
