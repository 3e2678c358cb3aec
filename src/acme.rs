//! ACME (Let's Encrypt) certificate management
//!
//! Certificates are requested on demand, one per SNI hostname, the first
//! time a client asks for a hostname that has no certificate yet. A request
//! is only made when the [`HostPolicy`] authorizes the hostname, which for
//! the gateway means some running container lists it in its TLS variable.
//!
//! Supported challenges:
//! - HTTP-01 (serves the token at /.well-known/acme-challenge/)
//! - TLS-ALPN-01 (serves a challenge certificate with the acme-tls/1 ALPN)
//!
//! # Key Storage
//! The cache directory holds the ACME account credentials and one
//! `<hostname>/cert.pem` + `<hostname>/key.pem` pair per hostname. Private
//! keys are written with mode 0600 on Unix but are not encrypted; restrict
//! access to the cache directory to the service user.

use crate::config::{AcmeChallengeType, AcmeConfig};
use crate::registry::Registry;
use dashmap::{DashMap, DashSet};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// ALPN protocol used by TLS-ALPN-01 validation
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";
const ACME_ALPN_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];

const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const RENEW_BEFORE_DAYS: u64 = 30;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 30;
/// A hostname whose issuance failed is not retried before this delay
const FAILED_ISSUANCE_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Admission check consulted before any certificate is requested
pub trait HostPolicy: Send + Sync {
    fn is_authorized(&self, hostname: &str) -> bool;
}

impl HostPolicy for Registry {
    fn is_authorized(&self, hostname: &str) -> bool {
        self.is_tls_authorized(hostname)
    }
}

/// Pending ACME challenges for HTTP-01 validation
#[derive(Clone, Default)]
pub struct Http01Challenges {
    inner: Arc<DashMap<String, String>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: String, key_authorization: String) {
        self.inner.insert(token, key_authorization);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.get(token).map(|v| v.value().clone())
    }

    pub fn remove(&self, token: &str) {
        self.inner.remove(token);
    }

    /// Key authorization for a `/.well-known/acme-challenge/<token>` path
    pub fn response_for_path(&self, path: &str) -> Option<String> {
        path.strip_prefix("/.well-known/acme-challenge/")
            .and_then(|token| self.get(token))
    }
}

struct Issuer {
    policy: Arc<dyn HostPolicy>,
    pending: DashSet<String>,
    requests: mpsc::UnboundedSender<String>,
}

/// SNI certificate resolver.
///
/// Lookups never block: a missing certificate queues an issuance request
/// and the current handshake gets the fallback certificate, if any.
pub struct CertResolver {
    certs: DashMap<String, Arc<CertifiedKey>>,
    challenge_certs: DashMap<String, Arc<CertifiedKey>>,
    fallback: Option<Arc<CertifiedKey>>,
    issuer: Option<Issuer>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("certs", &self.certs.len())
            .field("challenge_certs", &self.challenge_certs.len())
            .field("fallback", &self.fallback.is_some())
            .field("on_demand", &self.issuer.is_some())
            .finish()
    }
}

impl CertResolver {
    /// Resolver serving only the fallback certificate and inserted ones
    pub fn new(fallback: Option<Arc<CertifiedKey>>) -> Self {
        Self {
            certs: DashMap::new(),
            challenge_certs: DashMap::new(),
            fallback,
            issuer: None,
        }
    }

    fn with_issuer(
        fallback: Option<Arc<CertifiedKey>>,
        policy: Arc<dyn HostPolicy>,
        requests: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            issuer: Some(Issuer {
                policy,
                pending: DashSet::new(),
                requests,
            }),
            ..Self::new(fallback)
        }
    }

    pub fn insert(&self, hostname: &str, key: Arc<CertifiedKey>) {
        self.certs.insert(hostname.to_string(), key);
    }

    pub fn get(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.get(hostname).map(|c| Arc::clone(c.value()))
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.certs.iter().map(|c| c.key().clone()).collect()
    }

    /// Queue issuance for `hostname` if the policy allows it and none is
    /// already in flight. Returns whether a request was queued.
    pub fn request_issuance(&self, hostname: &str) -> bool {
        let Some(issuer) = &self.issuer else {
            return false;
        };

        if !issuer.policy.is_authorized(hostname) {
            info!(hostname, "Certificate issuance refused: hostname not listed for TLS");
            return false;
        }

        if !issuer.pending.insert(hostname.to_string()) {
            return false;
        }

        if issuer.requests.send(hostname.to_string()).is_err() {
            issuer.pending.remove(hostname);
            warn!(hostname, "Certificate issuer is not running");
            return false;
        }

        debug!(hostname, "Certificate issuance queued");
        true
    }

    fn finish_issuance(&self, hostname: &str) {
        if let Some(issuer) = &self.issuer {
            issuer.pending.remove(hostname);
        }
    }

    fn set_challenge_cert(&self, domain: &str, cert: Arc<CertifiedKey>) {
        self.challenge_certs.insert(domain.to_string(), cert);
    }

    fn remove_challenge_cert(&self, domain: &str) {
        self.challenge_certs.remove(domain);
    }

    fn lookup(&self, server_name: Option<&str>, acme_challenge: bool) -> Option<Arc<CertifiedKey>> {
        if acme_challenge {
            return server_name
                .and_then(|name| self.challenge_certs.get(name).map(|c| Arc::clone(c.value())));
        }

        let Some(name) = server_name else {
            return self.fallback.clone();
        };

        if let Some(cert) = self.get(name) {
            return Some(cert);
        }

        self.request_issuance(name);
        self.fallback.clone()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let is_acme_challenge = client_hello
            .alpn()
            .map(|mut alpn| alpn.any(|p| p == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);

        self.lookup(client_hello.server_name(), is_acme_challenge)
    }
}

enum PendingChallenge {
    Http01 { token: String },
    TlsAlpn01 { domain: String },
}

/// ACME certificate manager
pub struct AcmeManager {
    config: AcmeConfig,
    cache_dir: PathBuf,
    http01_challenges: Http01Challenges,
    resolver: Arc<CertResolver>,
    account: Mutex<Option<Account>>,
    requests: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl AcmeManager {
    /// Create the manager and load every cached certificate.
    ///
    /// Fails if the cache directory cannot be created.
    pub fn new(
        config: AcmeConfig,
        policy: Arc<dyn HostPolicy>,
        fallback: Option<Arc<CertifiedKey>>,
    ) -> anyhow::Result<Self> {
        let cache_dir = validate_cache_dir(&config.cache_dir)?;
        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            anyhow::anyhow!(
                "Cannot create ACME cache directory '{}': {}",
                cache_dir.display(),
                e
            )
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            config,
            cache_dir,
            http01_challenges: Http01Challenges::new(),
            resolver: Arc::new(CertResolver::with_issuer(fallback, policy, tx)),
            account: Mutex::new(None),
            requests: parking_lot::Mutex::new(Some(rx)),
        };

        let loaded = manager.load_cached_certs();
        info!(
            cache_dir = %manager.cache_dir.display(),
            certificates = loaded,
            "ACME manager initialized"
        );
        Ok(manager)
    }

    pub fn http01_challenges(&self) -> Http01Challenges {
        self.http01_challenges.clone()
    }

    pub fn resolver(&self) -> Arc<CertResolver> {
        Arc::clone(&self.resolver)
    }

    fn cert_dir(&self, hostname: &str) -> anyhow::Result<PathBuf> {
        if !is_valid_hostname(hostname) {
            anyhow::bail!("Refusing to use '{}' as a certificate cache name", hostname);
        }
        Ok(self.cache_dir.join(hostname))
    }

    /// Load `<cache_dir>/<hostname>/{cert,key}.pem` pairs that have not expired
    fn load_cached_certs(&self) -> usize {
        let entries = match std::fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Cannot read ACME cache directory");
                return 0;
            }
        };

        let mut loaded = 0;
        for entry in entries.flatten() {
            let Some(hostname) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !entry.path().is_dir() || !is_valid_hostname(&hostname) {
                continue;
            }

            match load_cert_pair(&entry.path()) {
                Ok(key) => {
                    let expired = key
                        .cert
                        .first()
                        .map(|c| !is_cert_valid_for_days(c, 0))
                        .unwrap_or(true);
                    if expired {
                        info!(hostname, "Skipping expired cached certificate");
                        continue;
                    }
                    debug!(hostname, "Loaded cached certificate");
                    self.resolver.insert(&hostname, key);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(hostname, error = %e, "Ignoring unreadable cached certificate");
                }
            }
        }
        loaded
    }

    /// Load or create the ACME account, once per process
    async fn account(&self) -> anyhow::Result<Account> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let account = self.load_or_create_account().await?;
        *guard = Some(account.clone());
        Ok(account)
    }

    async fn load_or_create_account(&self) -> anyhow::Result<Account> {
        let account_path = self.cache_dir.join("account.json");

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            let account = Account::from_credentials(credentials).await?;
            return Ok(account);
        }

        info!("Creating new ACME account");
        let email = self.config.email.as_ref().ok_or_else(|| {
            anyhow::anyhow!("ACME email is required for account creation")
        })?;

        let directory_url = self
            .config
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url());

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await?;

        let data = serde_json::to_string_pretty(&credentials)?;
        write_private(&account_path, &data)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        Ok(account)
    }

    /// Save a certificate to the cache with restricted key permissions
    fn save_cert(&self, hostname: &str, cert_chain_pem: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let dir = self.cert_dir(hostname)?;
        std::fs::create_dir_all(&dir)?;

        let cert_path = dir.join("cert.pem");
        std::fs::write(&cert_path, cert_chain_pem)?;
        write_private(&dir.join("key.pem"), private_key_pem)?;

        info!(hostname, path = %cert_path.display(), "Certificate saved to cache");
        Ok(())
    }

    /// Obtain a certificate for one hostname, returning `(chain_pem, key_pem)`
    async fn obtain_certificate(
        &self,
        account: &Account,
        domain: &str,
    ) -> anyhow::Result<(String, String)> {
        info!(domain, "Requesting new certificate");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge_type = match self.config.challenge_type {
                AcmeChallengeType::Http01 => ChallengeType::Http01,
                AcmeChallengeType::TlsAlpn01 => ChallengeType::TlsAlpn01,
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == challenge_type)
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Challenge type {:?} not available for {}",
                        self.config.challenge_type,
                        domain
                    )
                })?;

            let key_auth = order.key_authorization(challenge);
            let pending = match self.config.challenge_type {
                AcmeChallengeType::Http01 => {
                    debug!(domain, token = %challenge.token, "Setting up HTTP-01 challenge");
                    self.http01_challenges
                        .set(challenge.token.clone(), key_auth.as_str().to_string());
                    PendingChallenge::Http01 {
                        token: challenge.token.clone(),
                    }
                }
                AcmeChallengeType::TlsAlpn01 => {
                    debug!(domain, "Setting up TLS-ALPN-01 challenge");
                    let challenge_cert = create_tls_alpn01_cert(domain, key_auth.digest().as_ref())?;
                    self.resolver.set_challenge_cert(domain, challenge_cert);
                    PendingChallenge::TlsAlpn01 {
                        domain: domain.to_string(),
                    }
                }
            };

            let outcome = async {
                order.set_challenge_ready(&challenge.url).await?;
                wait_for_authorization(&mut order, domain).await
            }
            .await;

            match pending {
                PendingChallenge::Http01 { token } => self.http01_challenges.remove(&token),
                PendingChallenge::TlsAlpn01 { domain } => self.resolver.remove_challenge_cert(&domain),
            }
            outcome?;
        }

        wait_for_order_ready(&mut order).await?;

        // Generate CSR and finalize order
        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            let state = order.state();

            match state.status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("Order valid but no certificate returned");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLLS {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ => anyhow::bail!("Unexpected order status: {:?}", state.status),
            }
        };

        info!(domain, "Certificate obtained successfully");
        Ok((cert_chain_pem, private_key.serialize_pem()))
    }

    async fn issue(&self, hostname: &str) {
        let result = async {
            let account = self.account().await?;
            let (cert_pem, key_pem) = self.obtain_certificate(&account, hostname).await?;
            self.save_cert(hostname, &cert_pem, &key_pem)?;
            let key = load_certified_key(cert_pem.as_bytes(), key_pem.as_bytes())?;
            self.resolver.insert(hostname, key);
            anyhow::Ok(())
        }
        .await;

        match result {
            Ok(()) => info!(hostname, "Certificate installed"),
            Err(e) => {
                error!(hostname, error = %e, "Certificate issuance failed");
                tokio::time::sleep(FAILED_ISSUANCE_COOLDOWN).await;
            }
        }
        self.resolver.finish_issuance(hostname);
    }

    /// Queue renewal for certificates close to expiry.
    ///
    /// Renewal goes through the same policy check as first issuance, so a
    /// hostname that no running container claims anymore is not renewed.
    fn check_renewals(&self) -> usize {
        let mut queued = 0;
        for hostname in self.resolver.hostnames() {
            let Some(key) = self.resolver.get(&hostname) else {
                continue;
            };
            let expiring = key
                .cert
                .first()
                .map(|c| !is_cert_valid_for_days(c, RENEW_BEFORE_DAYS))
                .unwrap_or(true);

            if expiring {
                info!(hostname, "Certificate renewal needed");
                if self.resolver.request_issuance(&hostname) {
                    queued += 1;
                }
            }
        }
        queued
    }

    /// Process issuance requests and renew certificates until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let Some(mut requests) = self.requests.lock().take() else {
            anyhow::bail!("ACME manager is already running");
        };

        // First tick fires immediately, renewing expiring cached certificates
        let mut renewal = tokio::time::interval(RENEWAL_INTERVAL);

        loop {
            tokio::select! {
                Some(hostname) = requests.recv() => {
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.issue(&hostname).await;
                    });
                }
                _ = renewal.tick() => {
                    let queued = self.check_renewals();
                    debug!(queued, "Certificate renewal check complete");
                }
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow() {
                        info!("ACME manager shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn wait_for_authorization(order: &mut Order, domain: &str) -> anyhow::Result<()> {
    let mut attempts = 0;
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;

        order.refresh().await?;
        let auths = order.authorizations().await?;
        let current = auths
            .iter()
            .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == domain));

        match current.map(|a| &a.status) {
            Some(AuthorizationStatus::Valid) => {
                info!(domain, "Authorization valid");
                return Ok(());
            }
            Some(AuthorizationStatus::Pending) => {
                attempts += 1;
                if attempts > MAX_POLLS {
                    anyhow::bail!("Authorization timeout for {}", domain);
                }
                debug!(domain, attempt = attempts, "Waiting for authorization");
            }
            Some(AuthorizationStatus::Invalid) => {
                anyhow::bail!("Authorization failed for {}", domain);
            }
            Some(status) => {
                debug!(domain, status = ?status, "Authorization status");
            }
            None => {
                anyhow::bail!("Authorization not found for {}", domain);
            }
        }
    }
}

async fn wait_for_order_ready(order: &mut Order) -> anyhow::Result<()> {
    let mut attempts = 0;
    loop {
        match order.state().status {
            OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
            OrderStatus::Invalid => anyhow::bail!("Order invalid"),
            OrderStatus::Pending | OrderStatus::Processing => {
                attempts += 1;
                if attempts > MAX_POLLS {
                    anyhow::bail!("Order timeout");
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                order.refresh().await?;
            }
        }
    }
}

/// Create a TLS-ALPN-01 challenge certificate
fn create_tls_alpn01_cert(domain: &str, digest: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    use rcgen::{CustomExtension, IsCa, KeyUsagePurpose};

    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];

    // acmeIdentifier extension: OCTET STRING of the 32 byte digest
    let mut ext_value = vec![0x04, 0x20];
    ext_value.extend_from_slice(digest);

    let mut extension = CustomExtension::from_oid_content(ACME_ALPN_OID, ext_value);
    extension.set_criticality(true);
    params.custom_extensions.push(extension);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}

/// Build a rustls signing key from PEM encoded chain and private key
pub fn load_certified_key(cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_pem)).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in PEM data");
    }

    let key = load_private_key(key_pem).ok_or_else(|| anyhow::anyhow!("No private key found in PEM data"))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("Failed to create signing key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn load_cert_pair(dir: &Path) -> anyhow::Result<Arc<CertifiedKey>> {
    let cert = std::fs::read(dir.join("cert.pem"))?;
    let key = std::fs::read(dir.join("key.pem"))?;
    load_certified_key(&cert, &key)
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Write a file readable only by the owner (0600 on Unix)
fn write_private(path: &Path, contents: &str) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, contents.as_bytes())
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)
    }
}

/// Hostnames double as cache directory names
fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 253
        && !hostname.starts_with('.')
        && !hostname.contains("..")
        && hostname
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let expiry = parsed.validity().not_after.timestamp();

    let remaining_secs = expiry - now;
    if remaining_secs < 0 {
        info!("Certificate has already expired");
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        info!(
            remaining_days,
            required_days = days,
            "Certificate expires soon, renewal needed"
        );
        return false;
    }

    debug!(
        remaining_days,
        expiry_timestamp = expiry,
        "Certificate validity check passed"
    );
    true
}

/// Validate and canonicalize the ACME cache directory path
fn validate_cache_dir(path: &str) -> anyhow::Result<PathBuf> {
    if path.contains("..") {
        anyhow::bail!("ACME cache directory path must not contain '..'");
    }

    let path_buf = PathBuf::from(path);

    if path_buf.exists() {
        let canonical = path_buf.canonicalize().map_err(|e| {
            anyhow::anyhow!("Failed to canonicalize ACME cache directory '{}': {}", path, e)
        })?;

        if !canonical.is_dir() {
            anyhow::bail!("ACME cache path '{}' exists but is not a directory", path);
        }

        return Ok(canonical);
    }

    if let Some(parent) = path_buf.parent() {
        if parent.as_os_str().is_empty() {
            // Relative path with no parent (e.g., "acme_cache")
            return Ok(path_buf);
        }

        if parent.exists() {
            let canonical_parent = parent.canonicalize().map_err(|e| {
                anyhow::anyhow!("Failed to canonicalize parent directory: {}", e)
            })?;

            if let Some(file_name) = path_buf.file_name() {
                return Ok(canonical_parent.join(file_name));
            }
        }
    }

    Ok(path_buf)
}
