//! TLS termination with the certificate picked by SNI
//!
//! The ClientHello is read first, then the certificate provider is asked for the
//! requested server name. This may take a while (a certificate can be generated
//! or issued on the spot), so it happens asynchronously, outside rustls.

use crate::certificate::CertificateProvider;
use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use rustls::crypto::CryptoProvider;
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::debug;

/// Presents one certificate, already chosen for the connection
#[derive(Debug)]
struct ChosenCert(Arc<CertifiedKey>);

impl ResolvesServerCert for ChosenCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

pub struct TlsTerminator {
    provider: Arc<dyn CertificateProvider>,
    handshake_timeout: Duration,
    crypto: Arc<CryptoProvider>,
    /// Server config per domain, kept while its certificate is current so
    /// sessions can be resumed
    configs: DashMap<String, (Arc<CertifiedKey>, Arc<ServerConfig>)>,
}

impl TlsTerminator {
    pub fn new(provider: Arc<dyn CertificateProvider>, handshake_timeout: Duration) -> Self {
        Self {
            provider,
            handshake_timeout,
            crypto: Arc::new(rustls::crypto::ring::default_provider()),
            configs: DashMap::new(),
        }
    }

    /// Complete the TLS handshake on `stream`
    ///
    /// Fails when the client sends no server name or no certificate is available for it.
    /// Reading the ClientHello and finishing the handshake are each bounded by the
    /// handshake timeout; obtaining the certificate is not.
    pub async fn accept(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        let start = timeout(
            self.handshake_timeout,
            LazyConfigAcceptor::new(Acceptor::default(), stream),
        )
        .await
        .map_err(|_| anyhow!("timed out reading ClientHello"))?
        .context("reading ClientHello")?;

        let domain = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("ClientHello without server name"))?;

        debug!("TLS handshake for {}", domain);

        let cert = self
            .provider
            .certificate_for(&domain)
            .await
            .ok_or_else(|| anyhow!("no certificate for {}", domain))?;
        let config = self.config_for(&domain, cert)?;

        timeout(self.handshake_timeout, start.into_stream(config))
            .await
            .map_err(|_| anyhow!("TLS handshake for {} timed out", domain))?
            .with_context(|| format!("TLS handshake for {}", domain))
    }

    /// Cached config for `domain`, rebuilt when the certificate changes
    fn config_for(&self, domain: &str, cert: Arc<CertifiedKey>) -> Result<Arc<ServerConfig>> {
        if let Some(entry) = self.configs.get(domain) {
            let (current, config) = entry.value();
            if Arc::ptr_eq(current, &cert) {
                return Ok(config.clone());
            }
        }

        let config = server_config(self.crypto.clone(), cert.clone())?;
        self.configs
            .insert(domain.to_string(), (cert, config.clone()));
        Ok(config)
    }
}

/// HTTP/1.1-only server config presenting `cert`
pub fn server_config(
    crypto: Arc<CryptoProvider>,
    cert: Arc<CertifiedKey>,
) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(crypto)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ChosenCert(cert)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::certified_key_from_pem;
    use async_trait::async_trait;

    struct NoCertificates;

    #[async_trait]
    impl CertificateProvider for NoCertificates {
        async fn certificate_for(&self, _domain: &str) -> Option<Arc<CertifiedKey>> {
            None
        }
    }

    fn self_signed(domain: &str) -> Arc<CertifiedKey> {
        let generated = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        certified_key_from_pem(
            generated.cert.pem().as_bytes(),
            generated.key_pair.serialize_pem().as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_server_config_offers_http1_only() {
        let crypto = Arc::new(rustls::crypto::ring::default_provider());
        let config = server_config(crypto, self_signed("foo.test")).unwrap();

        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_config_reused_until_certificate_changes() {
        let tls = TlsTerminator::new(Arc::new(NoCertificates), Duration::from_secs(1));
        let cert = self_signed("foo.test");

        let first = tls.config_for("foo.test", cert.clone()).unwrap();
        let again = tls.config_for("foo.test", cert.clone()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let other = tls.config_for("bar.test", self_signed("bar.test")).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));

        let renewed_cert = self_signed("foo.test");
        let renewed = tls.config_for("foo.test", renewed_cert.clone()).unwrap();
        assert!(!Arc::ptr_eq(&first, &renewed));
        assert!(Arc::ptr_eq(
            &renewed,
            &tls.config_for("foo.test", renewed_cert).unwrap()
        ));
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tls = TlsTerminator::new(Arc::new(NoCertificates), Duration::from_millis(200));

        // Connects and never sends a ClientHello
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let Err(err) = tls.accept(stream).await else {
            panic!("handshake without ClientHello succeeded");
        };
        assert!(err.to_string().contains("ClientHello"));
    }
}
