//! Development certificates generated on this machine
//!
//! Certificates are looked up in memory, then on disk as
//! `<certs_dir>/<domain>-cert.pem` and `<certs_dir>/<domain>-key.pem`, and
//! generated on first use otherwise. Any requested domain is served.

use crate::certificate::{is_valid_domain_name, load_certified_key, CertCache, CertificateProvider};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Writes a certificate/key pair for a domain to the given paths
#[async_trait]
pub trait CertGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, domain: &str, cert_path: &Path, key_path: &Path) -> Result<()>;
}

/// Uses the `mkcert` tool, whose local CA browsers can be told to trust
pub struct Mkcert;

impl Mkcert {
    pub fn is_installed() -> bool {
        command_in_path("mkcert")
    }
}

#[async_trait]
impl CertGenerator for Mkcert {
    fn name(&self) -> &'static str {
        "mkcert"
    }

    async fn generate(&self, domain: &str, cert_path: &Path, key_path: &Path) -> Result<()> {
        let output = Command::new("mkcert")
            .arg("-key-file")
            .arg(key_path)
            .arg("-cert-file")
            .arg(cert_path)
            .arg(domain)
            .output()
            .await
            .context("running mkcert")?;

        if !output.status.success() {
            return Err(anyhow!(
                "mkcert exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(())
    }
}

/// Self-signed certificates generated in-process
pub struct SelfSigned;

#[async_trait]
impl CertGenerator for SelfSigned {
    fn name(&self) -> &'static str {
        "self-signed"
    }

    async fn generate(&self, domain: &str, cert_path: &Path, key_path: &Path) -> Result<()> {
        let names = vec![domain.to_string()];
        let (cert_pem, key_pem) = tokio::task::spawn_blocking(move || {
            rcgen::generate_simple_self_signed(names)
                .map(|generated| (generated.cert.pem(), generated.key_pair.serialize_pem()))
        })
        .await??;

        fs::write(cert_path, cert_pem).await?;
        fs::write(key_path, key_pem).await?;
        Ok(())
    }
}

/// Certificate provider backed by a local generator and a small on-disk cache
pub struct LocalCertificates {
    certs_dir: PathBuf,
    generator: Arc<dyn CertGenerator>,
    cache: CertCache,
}

impl LocalCertificates {
    pub fn new<P: AsRef<Path>>(certs_dir: P, generator: Arc<dyn CertGenerator>) -> Result<Self> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&certs_dir)
            .with_context(|| format!("creating {}", certs_dir.display()))?;

        Ok(Self {
            certs_dir,
            generator,
            cache: CertCache::new(),
        })
    }

    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.certs_dir.join(format!("{}-cert.pem", domain))
    }

    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.certs_dir.join(format!("{}-key.pem", domain))
    }

}

async fn load_or_generate(
    generator: Arc<dyn CertGenerator>,
    domain: String,
    cert_path: PathBuf,
    key_path: PathBuf,
) -> Result<Arc<CertifiedKey>> {
    if fs::try_exists(&cert_path).await? && fs::try_exists(&key_path).await? {
        debug!("Loading certificate for {} from {}", domain, cert_path.display());
    } else {
        info!("Generating {} certificate for {}", generator.name(), domain);
        generator.generate(&domain, &cert_path, &key_path).await?;
    }

    load_certified_key(&cert_path, &key_path).await
}

#[async_trait]
impl CertificateProvider for LocalCertificates {
    async fn certificate_for(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        if !is_valid_domain_name(domain) {
            warn!("Refusing certificate for invalid name {:?}", domain);
            return None;
        }

        let generator = Arc::clone(&self.generator);
        let (cert_path, key_path) = (self.cert_path(domain), self.key_path(domain));
        let name = domain.to_string();

        match self
            .cache
            .get_or_try_insert_with(domain, move || {
                load_or_generate(generator, name, cert_path, key_path)
            })
            .await
        {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!("No certificate for {}: {:#}", domain, e);
                None
            }
        }
    }
}

/// Whether an executable called `name` exists on `PATH`
pub fn command_in_path(name: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };

    env::split_paths(&paths).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}
