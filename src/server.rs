//! Process-level orchestration
//!
//! Startup order is takeover, routes, control listener, then the HTTP(S)
//! listeners. `run` returns once a `shutdown` command arrives, after every
//! listener has been closed.

use crate::acme::{AcmeCertificates, Http01Challenges};
use crate::config::{CertTool, Config, Mode};
use crate::control::ControlListener;
use crate::local_certs::{CertGenerator, LocalCertificates, Mkcert, SelfSigned};
use crate::proxy::ProxyServer;
use crate::redirect::Redirector;
use crate::routes::Routes;
use crate::takeover::{acquire_control_socket, bind_tcp};
use crate::tls::TlsTerminator;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub struct CoreServer {
    config: Config,
}

impl CoreServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.config;
        info!("Starting coreproxy in {} mode", config.mode.as_str());

        let control_socket = acquire_control_socket(config.control_addr, config.takeover).await?;

        let routes = match &config.routes_file {
            Some(path) => Routes::load(path),
            None => {
                warn!("No config directory, routes will not be persisted");
                Routes::in_memory()
            }
        };

        let control = ControlListener::new(control_socket, routes.clone());
        info!("Control listener on udp://{}", control.local_addr()?);

        let proxy = Arc::new(ProxyServer::new(config.proxy, routes.clone()));
        let mut servers = JoinSet::new();

        match config.mode {
            Mode::Production => {
                let acme = Arc::new(AcmeCertificates::new(
                    config.acme.clone(),
                    routes.clone(),
                    Http01Challenges::new(),
                )?);
                let tls = Arc::new(TlsTerminator::new(acme.clone(), config.handshake_timeout));

                let https = bind_tcp(config.https_addr, config.takeover).await?;
                let http = bind_tcp(config.http_addr, config.takeover).await?;

                servers.spawn(proxy.serve_https(https, tls));
                servers.spawn(Arc::new(Redirector::new(Some(acme.challenges()))).serve(http));

                let interval = config.renewal_interval;
                servers.spawn(async move {
                    acme.run_renewal(interval).await;
                    Ok(())
                });
            }
            Mode::Development => match local_generator(config.cert_tool) {
                Some(generator) => {
                    let certs = Arc::new(LocalCertificates::new(&config.certs_dir, generator)?);
                    let tls = Arc::new(TlsTerminator::new(certs, config.handshake_timeout));

                    let https = bind_tcp(config.https_addr, config.takeover).await?;
                    let http = bind_tcp(config.http_addr, config.takeover).await?;

                    servers.spawn(proxy.serve_https(https, tls));
                    servers.spawn(Arc::new(Redirector::new(None)).serve(http));
                }
                None => {
                    info!("No certificate tool available, serving plain HTTP only");
                    let http = bind_tcp(config.http_addr, config.takeover).await?;
                    servers.spawn(proxy.serve_http(http));
                }
            },
        }

        let result = tokio::select! {
            _ = control.run() => {
                info!("Shutting down");
                Ok(())
            }
            Some(joined) = servers.join_next() => match joined {
                Ok(Ok(())) => Err(anyhow!("listener exited unexpectedly")),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            },
        };

        // Closes the listening sockets before a successor tries to bind them
        servers.shutdown().await;
        result
    }
}

fn local_generator(tool: CertTool) -> Option<Arc<dyn CertGenerator>> {
    match tool {
        CertTool::Auto if Mkcert::is_installed() => Some(Arc::new(Mkcert)),
        CertTool::Auto | CertTool::None => None,
        CertTool::Mkcert => Some(Arc::new(Mkcert)),
        CertTool::SelfSigned => Some(Arc::new(SelfSigned)),
    }
}
