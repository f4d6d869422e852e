//! coreproxy - lets many local web servers share ports 80 and 443
//!
//! Backends announce `<domain> <port>` over a loopback UDP control channel.
//! The proxy terminates HTTP/HTTPS for every announced domain and forwards each
//! request by Host header:
//! - Routing table persisted as a plain-text snapshot
//! - On-demand TLS certificates (mkcert/self-signed locally, ACME in production)
//! - Singleton takeover: a new instance shuts down the running one
//! - WebSocket proxy support

pub mod acme;
pub mod certificate;
pub mod config;
pub mod control;
pub mod error;
pub mod local_certs;
pub mod proxy;
pub mod redirect;
pub mod routes;
pub mod server;
pub mod takeover;
pub mod tls;

pub use certificate::CertificateProvider;
pub use config::{CertTool, Config, Mode};
pub use control::{announce, Command, ControlListener};
pub use proxy::{ProxyConfig, ProxyServer};
pub use routes::{ForwardTarget, Routes};
pub use server::CoreServer;
