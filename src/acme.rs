//! Public certificates issued on demand through ACME (Let's Encrypt)
//!
//! Issuance is gated by a host policy: only domains that are currently in the
//! routing table get a certificate. Without it, anyone could point DNS at this
//! machine and make it request certificates for arbitrary names.
//!
//! Challenges use HTTP-01; the tokens are served by the plain-HTTP redirector
//! through [`Http01Challenges`]. Issued pairs are stored under
//! `<cache_dir>/<domain>/` and survive restarts.

use crate::certificate::{
    certified_key_from_pem, is_valid_domain_name, CertCache, CertificateProvider,
};
use crate::routes::Routes;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

const RENEW_BEFORE_DAYS: u64 = 30;
const POLL_ATTEMPTS: usize = 12;

/// Key authorizations for pending HTTP-01 challenges, by token
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<DashMap<String, String>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, key_authorization: &str) {
        self.inner
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.get(token).map(|v| v.value().clone())
    }

    pub fn remove(&self, token: &str) {
        self.inner.remove(token);
    }
}

#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Account credentials and issued certificates live here
    pub cache_dir: PathBuf,
    pub directory_url: String,
    /// Contact e-mail registered with the account
    pub contact: Option<String>,
}

impl AcmeConfig {
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            directory_url: LetsEncrypt::Production.url().to_string(),
            contact: None,
        }
    }
}

/// Certificate provider that issues certificates for routed domains through ACME
pub struct AcmeCertificates {
    routes: Routes,
    issuer: Arc<Issuer>,
    cache: CertCache,
}

/// Account, storage and ACME orders; shared with in-flight issuance tasks
struct Issuer {
    config: AcmeConfig,
    challenges: Http01Challenges,
    account: OnceCell<Account>,
}

impl AcmeCertificates {
    pub fn new(config: AcmeConfig, routes: Routes, challenges: Http01Challenges) -> Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)
            .with_context(|| format!("creating {}", config.cache_dir.display()))?;

        Ok(Self {
            routes,
            issuer: Arc::new(Issuer {
                config,
                challenges,
                account: OnceCell::new(),
            }),
            cache: CertCache::new(),
        })
    }

    pub fn challenges(&self) -> Http01Challenges {
        self.issuer.challenges.clone()
    }

    /// Host policy: only domains in the routing table may get a certificate
    pub fn is_allowed(&self, domain: &str) -> bool {
        is_valid_domain_name(domain) && self.routes.contains(domain)
    }

    /// Periodically re-issue cached certificates that are about to expire
    pub async fn run_renewal(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            for domain in self.cache.domains() {
                let Some(current) = self.cache.get(&domain).await else {
                    continue;
                };
                if !needs_renewal(&current) || !self.is_allowed(&domain) {
                    continue;
                }

                match self.issuer.issue(&domain).await {
                    Ok(renewed) => {
                        self.cache.insert(&domain, renewed).await;
                        info!("Renewed certificate for {}", domain);
                    }
                    Err(e) => error!("Failed to renew certificate for {}: {:#}", domain, e),
                }
            }
        }
    }
}

impl Issuer {
    fn domain_dir(&self, domain: &str) -> PathBuf {
        self.config.cache_dir.join(domain)
    }

    async fn account(&self) -> Result<&Account> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account> {
        let path = self.config.cache_dir.join("account.json");

        if fs::try_exists(&path).await? {
            debug!("Loading ACME account from {}", path.display());
            let data = fs::read_to_string(&path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!("Creating ACME account at {}", self.config.directory_url);
        let contact: Vec<String> = self
            .config
            .contact
            .iter()
            .map(|email| format!("mailto:{}", email))
            .collect();
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.config.directory_url,
            None,
        )
        .await?;

        write_private(&path, serde_json::to_string_pretty(&credentials)?.as_bytes()).await?;
        info!("ACME account credentials saved to {}", path.display());

        Ok(account)
    }

    /// Previously issued pair, if it is not close to expiry
    async fn load_cached(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        let dir = self.domain_dir(domain);
        let cert_pem = fs::read(dir.join("cert.pem")).await.ok()?;
        let key_pem = fs::read(dir.join("key.pem")).await.ok()?;

        let key = match certified_key_from_pem(&cert_pem, &key_pem) {
            Ok(key) => key,
            Err(e) => {
                warn!("Ignoring cached certificate for {}: {:#}", domain, e);
                return None;
            }
        };

        if needs_renewal(&key) {
            info!("Cached certificate for {} expires soon", domain);
            return None;
        }

        debug!("Loaded cached certificate for {}", domain);
        Some(key)
    }

    async fn load_or_issue(&self, domain: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(key) = self.load_cached(domain).await {
            return Ok(key);
        }
        self.issue(domain).await
    }

    /// Run an ACME order for `domain` and store the result
    async fn issue(&self, domain: &str) -> Result<Arc<CertifiedKey>> {
        info!("Requesting certificate for {}", domain);
        let account = self.account().await?;

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(domain.to_string())],
            })
            .await?;

        let (cert_pem, key_pem) = {
            let mut published = PublishedTokens::new(&self.challenges);
            self.authorize_and_finalize(&mut order, domain, &mut published)
                .await?
        };

        let dir = self.domain_dir(domain);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join("cert.pem"), &cert_pem).await?;
        write_private(&dir.join("key.pem"), key_pem.as_bytes()).await?;
        info!("Certificate for {} issued and saved to {}", domain, dir.display());

        certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
    }

    async fn authorize_and_finalize(
        &self,
        order: &mut Order,
        domain: &str,
        published: &mut PublishedTokens<'_>,
    ) -> Result<(String, String)> {
        let authorizations = order.authorizations().await?;

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                ref status => bail!("authorization for {} is {:?}", domain, status),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow!("no HTTP-01 challenge offered for {}", domain))?;

            let key_authorization = order.key_authorization(challenge);
            published.publish(&challenge.token, key_authorization.as_str());

            order.set_challenge_ready(&challenge.url).await?;
        }

        let mut delay = Duration::from_millis(250);
        let mut ready = false;
        for _ in 0..POLL_ATTEMPTS {
            tokio::time::sleep(delay).await;
            match order.refresh().await?.status {
                OrderStatus::Ready | OrderStatus::Valid => {
                    ready = true;
                    break;
                }
                OrderStatus::Invalid => bail!("order for {} became invalid", domain),
                OrderStatus::Pending | OrderStatus::Processing => {
                    debug!("Order for {} not ready yet", domain);
                }
            }
            delay = (delay * 2).min(Duration::from_secs(10));
        }
        if !ready {
            bail!("timed out waiting for the order for {}", domain);
        }

        let name = domain.to_string();
        let (csr, private_key) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut params = CertificateParams::new(vec![name])?;
            params.distinguished_name = DistinguishedName::new();
            let private_key = KeyPair::generate()?;
            let csr = params.serialize_request(&private_key)?;
            Ok((csr.der().to_vec(), private_key))
        })
        .await??;

        order.finalize(&csr).await?;

        for _ in 0..POLL_ATTEMPTS {
            if let Some(cert_pem) = order.certificate().await? {
                return Ok((cert_pem, private_key.serialize_pem()));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        bail!("timed out waiting for the certificate for {}", domain)
    }
}

/// Challenge tokens published for one order; withdrawn when the order ends
struct PublishedTokens<'a> {
    challenges: &'a Http01Challenges,
    tokens: Vec<String>,
}

impl<'a> PublishedTokens<'a> {
    fn new(challenges: &'a Http01Challenges) -> Self {
        Self {
            challenges,
            tokens: Vec::new(),
        }
    }

    fn publish(&mut self, token: &str, key_authorization: &str) {
        self.challenges.insert(token, key_authorization);
        self.tokens.push(token.to_string());
    }
}

impl Drop for PublishedTokens<'_> {
    fn drop(&mut self) {
        for token in &self.tokens {
            self.challenges.remove(token);
        }
    }
}

#[async_trait]
impl CertificateProvider for AcmeCertificates {
    async fn certificate_for(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        if !self.is_allowed(domain) {
            debug!("Host policy refused certificate for {:?}", domain);
            return None;
        }

        let issuer = Arc::clone(&self.issuer);
        let name = domain.to_string();

        match self
            .cache
            .get_or_try_insert_with(domain, move || async move {
                issuer.load_or_issue(&name).await
            })
            .await
        {
            Ok(cert) => Some(cert),
            Err(e) => {
                error!("Failed to obtain certificate for {}: {:#}", domain, e);
                None
            }
        }
    }
}

fn needs_renewal(key: &CertifiedKey) -> bool {
    key.cert
        .first()
        .map(|cert| expires_within(cert, RENEW_BEFORE_DAYS))
        .unwrap_or(true)
}

/// True if `cert` expires within `days` days, or cannot be parsed
pub fn expires_within(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let parsed = match X509Certificate::from_der(cert.as_ref()) {
        Ok((_, parsed)) => parsed,
        Err(e) => {
            warn!("Failed to parse certificate: {}", e);
            return true;
        }
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let remaining = parsed.validity().not_after.timestamp() - now;

    remaining < (days * 24 * 60 * 60) as i64
}

/// Write a file readable by the owner only
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.flush().await
}
