//! Certificate provisioning for TLS handshakes
//!
//! The TLS front asks a [`CertificateProvider`] for the certificate of the
//! server name in each ClientHello. Two providers exist: locally generated
//! development certificates ([`crate::local_certs`]) and ACME-issued public
//! certificates ([`crate::acme`]).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

/// Supplies the certificate presented for a server name
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Certificate for `domain`, or `None` to fail the handshake
    async fn certificate_for(&self, domain: &str) -> Option<Arc<CertifiedKey>>;
}

/// Per-domain certificate cache with single-flight creation
///
/// Each domain has its own async mutex. Concurrent callers for a domain that is
/// not cached yet queue on that mutex, so only the first one runs `make`; the
/// rest get its result. `make` runs on its own task holding the slot, so it
/// completes and caches its result even when every caller has given up waiting.
/// Failures are not cached and their slot is dropped; the next caller tries again.
pub struct CertCache<T = Arc<CertifiedKey>> {
    slots: Arc<DashMap<String, Slot<T>>>,
}

type Slot<T> = Arc<TokioMutex<Option<T>>>;

impl<T: Clone + Send + 'static> CertCache<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    fn slot(&self, domain: &str) -> Slot<T> {
        // Clone the Arc out so the shard lock is released before awaiting
        Arc::clone(&self.slots.entry(domain.to_string()).or_default())
    }

    fn is_current(&self, domain: &str, slot: &Slot<T>) -> bool {
        self.slots
            .get(domain)
            .map(|current| Arc::ptr_eq(current.value(), slot))
            .unwrap_or(false)
    }

    pub async fn get_or_try_insert_with<F, Fut>(&self, domain: &str, make: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (slot, mut entry) = loop {
            let slot = self.slot(domain);
            let entry = Arc::clone(&slot).lock_owned().await;
            // A failed creation may have dropped this slot while we queued
            if self.is_current(domain, &slot) {
                break (slot, entry);
            }
        };

        if let Some(value) = entry.as_ref() {
            return Ok(value.clone());
        }

        let pending = make();
        let slots = Arc::clone(&self.slots);
        let domain = domain.to_string();

        tokio::spawn(async move {
            match pending.await {
                Ok(value) => {
                    *entry = Some(value.clone());
                    Ok(value)
                }
                Err(e) => {
                    drop(entry);
                    remove_empty_slot(&slots, &domain, &slot);
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| anyhow!("certificate task failed: {}", e))?
    }

    pub async fn get(&self, domain: &str) -> Option<T> {
        let slot = self.slots.get(domain).map(|s| Arc::clone(s.value()))?;
        let entry = slot.lock().await;
        entry.clone()
    }

    /// Replace the cached value for `domain`
    pub async fn insert(&self, domain: &str, value: T) {
        let slot = self.slot(domain);
        *slot.lock().await = Some(value);
    }

    pub fn domains(&self) -> Vec<String> {
        self.slots.iter().map(|e| e.key().clone()).collect()
    }
}

/// Drop `slot` unless it was replaced, filled, or another caller is queued on it
fn remove_empty_slot<T>(slots: &DashMap<String, Slot<T>>, domain: &str, slot: &Slot<T>) {
    slots.remove_if(domain, |_, current| {
        Arc::ptr_eq(current, slot)
            && current
                .try_lock()
                .map(|entry| entry.is_none())
                .unwrap_or(false)
    });
}

impl<T: Clone + Send + 'static> Default for CertCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `domain` is safe to use as part of a file name
pub fn is_valid_domain_name(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && !domain.starts_with('.')
        && !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Load a PEM certificate chain and private key from disk
pub async fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let cert_pem = tokio::fs::read(cert_path)
        .await
        .with_context(|| format!("reading {}", cert_path.display()))?;
    let key_pem = tokio::fs::read(key_path)
        .await
        .with_context(|| format!("reading {}", key_path.display()))?;

    certified_key_from_pem(&cert_pem, &key_pem)
}

pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<CertifiedKey>> {
    let certs = parse_certs(cert_pem)?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .context("parsing private key")?
        .ok_or_else(|| anyhow!("no private key found"))?;

    certified_key(certs, key)
}

pub fn parse_certs(cert_pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("parsing certificate chain")?;

    if certs.is_empty() {
        return Err(anyhow!("no certificate found"));
    }

    Ok(certs)
}

pub fn certified_key(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>> {
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow!("unsupported private key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}
