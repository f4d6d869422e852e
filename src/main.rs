//! coreproxy - Main entry point
//!
//! Shares ports 80/443 between local web servers that announce themselves over UDP

use anyhow::{Context, Result};
use clap::Parser;
use coreproxy::{CertTool, Config, CoreServer, Mode};
use std::fs::{self, OpenOptions};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// coreproxy - Host-based reverse proxy for local web servers
#[derive(Parser, Debug)]
#[command(name = "coreproxy")]
#[command(author = "CoreProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Share ports 80/443 between local web servers")]
struct Args {
    /// Plain HTTP listen address
    #[arg(long, env = "HTTP_ADDR")]
    http_addr: Option<SocketAddr>,

    /// HTTPS listen address
    #[arg(long, env = "HTTPS_ADDR")]
    https_addr: Option<SocketAddr>,

    /// UDP control address (must stay on loopback)
    #[arg(long, env = "CONTROL_ADDR")]
    control_addr: Option<SocketAddr>,

    /// Routes snapshot file
    #[arg(long, env = "ROUTES_FILE")]
    routes_file: Option<PathBuf>,

    /// Directory for development certificates
    #[arg(long, env = "CERTS_DIR")]
    certs_dir: Option<PathBuf>,

    /// Development certificate generator
    #[arg(long, env = "CERT_TOOL", value_enum, default_value = "auto")]
    cert_tool: CertTool,

    /// ACME account and certificate cache (production)
    #[arg(long, env = "ACME_CACHE_DIR")]
    acme_cache_dir: Option<PathBuf>,

    /// ACME directory URL (production)
    #[arg(long, env = "ACME_DIRECTORY_URL")]
    acme_directory_url: Option<String>,

    /// Contact e-mail for the ACME account (production)
    #[arg(long, env = "ACME_CONTACT")]
    acme_contact: Option<String>,

    /// Seconds to wait for a previous instance to release its ports
    #[arg(long, env = "TAKEOVER_TIMEOUT", default_value = "2")]
    takeover_timeout: u64,

    /// Log file, appended to (default in production: logs/core.log)
    #[arg(long, env = "LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config::for_mode(Mode::from_build());

        if let Some(addr) = self.http_addr {
            config.http_addr = addr;
        }
        if let Some(addr) = self.https_addr {
            config.https_addr = addr;
        }
        if let Some(addr) = self.control_addr {
            config.control_addr = addr;
        }
        if self.routes_file.is_some() {
            config.routes_file = self.routes_file;
        }
        if let Some(dir) = self.certs_dir {
            config.certs_dir = dir;
        }
        config.cert_tool = self.cert_tool;
        if let Some(dir) = self.acme_cache_dir {
            config.acme.cache_dir = dir;
        }
        if let Some(url) = self.acme_directory_url {
            config.acme.directory_url = url;
        }
        config.acme.contact = self.acme_contact;
        config.takeover.deadline = Duration::from_secs(self.takeover_timeout);
        if self.log_file.is_some() {
            config.log_file = self.log_file;
        }

        config
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;

            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = args.log_level.clone();
    let config = args.into_config();

    init_logging(&log_level, config.log_file.as_deref())?;

    // The ACME client builds its TLS config from the process-wide provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting coreproxy v1.0.0");
    info!("HTTP address: {}", config.http_addr);
    if let Some(path) = &config.routes_file {
        info!("Routes file: {}", path.display());
    }

    CoreServer::new(config).run().await?;

    info!("coreproxy stopped");
    Ok(())
}
