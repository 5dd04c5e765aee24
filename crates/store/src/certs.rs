//! Local certificate store: validates TLS secret material, persists it and tracks content changes.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::chain::{ChainFetcher, DEFAULT_MAX_DEPTH};
use crate::der;

/// Directory holding one `<namespace>-<name>.pem` bundle per secret.
pub const DEFAULT_SSL_DIR: &str = "/etc/ingress-controller/ssl";

const OWNER_RW: u32 = 0o600;

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("local SSL certificate {0} was not found")]
    NotFound(String),
    #[error("no valid PEM formatted block found")]
    NoPemBlock,
    #[error("unexpected PEM block {found:?}, expected {expected}")]
    BlockType { found: String, expected: &'static str },
    #[error("invalid PEM data: {0}")]
    Pem(#[from] ::pem::PemError),
    #[error("unexpected error parsing certificate: {0}")]
    Parse(String),
    #[error("invalid private key: {0}")]
    Key(String),
    #[error("private key does not match public key")]
    KeyMismatch,
    #[error("error decoding CA certificate/s: {0}")]
    Ca(String),
    #[error("invalid CRL: {0}")]
    Crl(String),
    #[error("CRL provided without a CA certificate")]
    CrlWithoutCa,
    #[error("secret carries neither a certificate/key pair nor a CA bundle")]
    NoMaterial,
    #[error("could not write {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

/// Raw TLS payload of a secret.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub ca: Option<Vec<u8>>,
    pub crl: Option<Vec<u8>>,
}

impl TlsMaterial {
    pub const CERT: &'static str = "tls.crt";
    pub const KEY: &'static str = "tls.key";
    pub const CA: &'static str = "ca.crt";
    pub const CRL: &'static str = "ca.crl";

    pub fn from_secret(secret: &Secret) -> Self {
        let field = |name: &str| {
            secret.data.as_ref().and_then(|d| d.get(name)).map(|b| b.0.clone()).filter(|b| !b.is_empty())
        };
        Self { cert: field(Self::CERT), key: field(Self::KEY), ca: field(Self::CA), crl: field(Self::CRL) }
    }
}

/// Parsed and persisted view of one TLS secret.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateRecord {
    /// `namespace/name` of the owning secret.
    pub key: String,
    pub uid: String,
    pub common_names: BTreeSet<String>,
    pub expires: DateTime<Utc>,
    pub pem_sha: String,
    pub ca_sha: String,
    pub crl_sha: String,
    /// Certificate chain followed by the private key; never serialized.
    #[serde(skip)]
    pub pem_cert_key: String,
    pub pem_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub crl_file: Option<PathBuf>,
}

impl PartialEq for CertificateRecord {
    fn eq(&self, other: &Self) -> bool {
        self.ca_sha == other.ca_sha
            && self.pem_sha == other.pem_sha
            && self.expires == other.expires
            && self.uid == other.uid
            && self.common_names == other.common_names
    }
}

impl Eq for CertificateRecord {}

#[derive(Debug, Clone)]
pub struct CertConfig {
    pub ssl_dir: PathBuf,
    /// Fetch missing intermediates over HTTP.
    pub chain_completion: bool,
    /// Also collect e-mail and IP subject alternative names.
    pub extended_names: bool,
    pub fetch_timeout: Duration,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            ssl_dir: PathBuf::from(DEFAULT_SSL_DIR),
            chain_completion: false,
            extended_names: false,
            fetch_timeout: crate::chain::DEFAULT_FETCH_TIMEOUT,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String { format!("{:x}", Sha256::digest(bytes)) }

fn file_stem(key: &str) -> String { key.replace('/', "-") }

fn write_private(path: &Path, contents: &[u8]) -> Result<(), CertError> {
    let io = |source| CertError::Io { path: path.to_path_buf(), source };
    if let Some(dir) = path.parent() { fs::create_dir_all(dir).map_err(io)?; }
    let mut f = OpenOptions::new().create(true).write(true).truncate(true).mode(OWNER_RW).open(path).map_err(io)?;
    f.write_all(contents).map_err(io)?;
    // mode() only applies on creation
    fs::set_permissions(path, fs::Permissions::from_mode(OWNER_RW)).map_err(io)
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write every file to a sibling `.tmp` first and rename only once all of them are staged.
fn replace_all(files: &[(PathBuf, Vec<u8>)]) -> Result<(), CertError> {
    let staged: Vec<PathBuf> = files.iter().map(|(path, _)| staging_path(path)).collect();
    let discard = |from: usize| {
        for tmp in &staged[from..] { let _ = fs::remove_file(tmp); }
    };
    for (tmp, (_, contents)) in staged.iter().zip(files) {
        if let Err(e) = write_private(tmp, contents) {
            discard(0);
            return Err(e);
        }
    }
    for (i, (tmp, (path, _))) in staged.iter().zip(files).enumerate() {
        if let Err(source) = fs::rename(tmp, path) {
            discard(i);
            return Err(CertError::Io { path: path.clone(), source });
        }
    }
    Ok(())
}

fn first_block(bytes: &[u8], expected: &'static str) -> Result<::pem::Pem, CertError> {
    let block = ::pem::parse_many(bytes)?.into_iter().next().ok_or(CertError::NoPemBlock)?;
    if block.tag() != expected {
        return Err(CertError::BlockType { found: block.tag().to_string(), expected });
    }
    Ok(block)
}

fn parse_cert(der: &[u8]) -> Result<X509Certificate<'_>, CertError> {
    X509Certificate::from_der(der).map(|(_, c)| c).map_err(|e| CertError::Parse(e.to_string()))
}

fn not_after(cert: &X509Certificate<'_>) -> Result<DateTime<Utc>, CertError> {
    let ts = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(ts, 0).ok_or_else(|| CertError::Parse(format!("expiry {ts} out of range")))
}

/// Normalize a PEM private key to PKCS#8 DER.
fn pkcs8_der(key_pem: &[u8]) -> Result<Vec<u8>, CertError> {
    let block = ::pem::parse_many(key_pem)?
        .into_iter()
        .find(|b| b.tag().ends_with("PRIVATE KEY"))
        .ok_or(CertError::Key("no private key block".into()))?;
    match block.tag() {
        "PRIVATE KEY" => Ok(block.into_contents()),
        "RSA PRIVATE KEY" => Ok(der::pkcs1_to_pkcs8(block.contents())),
        "EC PRIVATE KEY" => der::sec1_to_pkcs8(block.contents()).ok_or(CertError::Key("EC key without curve parameters".into())),
        other => Err(CertError::Key(format!("unsupported key type {other}"))),
    }
}

fn check_key_pair(cert: &X509Certificate<'_>, key_pem: &[u8]) -> Result<(), CertError> {
    let der = pkcs8_der(key_pem)?;
    let pair = rcgen::KeyPair::try_from(der.as_slice()).map_err(|e| CertError::Key(e.to_string()))?;
    if pair.public_key_raw() != cert.public_key().subject_public_key.data.as_ref() {
        return Err(CertError::KeyMismatch);
    }
    Ok(())
}

/// Subject common name plus alternative names, de-duplicated.
fn names(cert: &X509Certificate<'_>, extended: bool) -> BTreeSet<String> {
    let mut out: BTreeSet<String> =
        cert.subject().iter_common_name().filter_map(|cn| cn.as_str().ok()).map(str::to_string).collect();
    match cert.subject_alternative_name() {
        Ok(Some(san)) => {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => { out.insert(dns.to_string()); }
                    GeneralName::RFC822Name(email) if extended => { out.insert(email.to_string()); }
                    GeneralName::IPAddress(ip) if extended => {
                        if let Some(addr) = ip_string(ip) { out.insert(addr); }
                    }
                    _ => {}
                }
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "ignoring malformed subjectAltName extension"),
    }
    out
}

fn ip_string(raw: &[u8]) -> Option<String> {
    match raw.len() {
        4 => <[u8; 4]>::try_from(raw).ok().map(|b| std::net::Ipv4Addr::from(b).to_string()),
        16 => <[u8; 16]>::try_from(raw).ok().map(|b| std::net::Ipv6Addr::from(b).to_string()),
        _ => None,
    }
}

fn check_ca(ca: &[u8]) -> Result<Vec<DateTime<Utc>>, CertError> {
    let blocks = ::pem::parse_many(ca).map_err(|e| CertError::Ca(e.to_string()))?;
    let mut expiries = Vec::with_capacity(blocks.len());
    for b in &blocks {
        let cert = parse_cert(b.contents()).map_err(|e| CertError::Ca(e.to_string()))?;
        expiries.push(not_after(&cert)?);
    }
    if expiries.is_empty() {
        return Err(CertError::Ca("no certificate found".into()));
    }
    Ok(expiries)
}

fn check_crl(crl: &[u8]) -> Result<(), CertError> {
    let block = first_block(crl, "X509 CRL").map_err(|e| CertError::Crl(e.to_string()))?;
    x509_parser::parse_x509_crl(block.contents()).map_err(|e| CertError::Crl(e.to_string()))?;
    Ok(())
}

/// Thread-safe map of certificate records keyed by secret identity.
pub struct CertStore {
    cfg: CertConfig,
    records: RwLock<FxHashMap<String, CertificateRecord>>,
    fetcher: Option<ChainFetcher>,
}

impl CertStore {
    pub fn new(cfg: CertConfig) -> Self {
        let fetcher = if cfg.chain_completion {
            match ChainFetcher::new(cfg.fetch_timeout, DEFAULT_MAX_DEPTH) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(error = %e, "cannot build http client; ssl chain completion disabled");
                    None
                }
            }
        } else {
            None
        };
        Self { cfg, records: RwLock::new(FxHashMap::default()), fetcher }
    }

    pub fn config(&self) -> &CertConfig { &self.cfg }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<String, CertificateRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }
    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<String, CertificateRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate and store a certificate/key pair for `key`.
    pub async fn put(&self, key: &str, cert: &[u8], private_key: &[u8]) -> Result<CertificateRecord, CertError> {
        let material = TlsMaterial { cert: Some(cert.to_vec()), key: Some(private_key.to_vec()), ..TlsMaterial::default() };
        self.put_material(key, "", &material).await
    }

    /// Validate, persist and store everything a secret carries.
    ///
    /// On any error the previous record for `key` stays in place and its files are untouched. A
    /// record equal to the stored one, with the same bundle, is not rewritten.
    pub async fn put_material(&self, key: &str, uid: &str, m: &TlsMaterial) -> Result<CertificateRecord, CertError> {
        let stem = file_stem(key);
        let mut files: Vec<(PathBuf, Vec<u8>)> = Vec::new();
        let mut rec = match (&m.cert, &m.key) {
            (Some(cert), Some(private_key)) => {
                let cert = self.maybe_complete(key, cert).await;
                let leaf = first_block(&cert, "CERTIFICATE")?;
                let parsed = parse_cert(leaf.contents())?;
                check_key_pair(&parsed, private_key)?;
                let mut bundle = cert.clone();
                bundle.push(b'\n');
                bundle.extend_from_slice(private_key);
                let pem_file = self.cfg.ssl_dir.join(format!("{stem}.pem"));
                let rec = CertificateRecord {
                    key: key.to_string(),
                    uid: uid.to_string(),
                    common_names: names(&parsed, self.cfg.extended_names),
                    expires: not_after(&parsed)?,
                    pem_sha: sha256_hex(leaf.contents()),
                    ca_sha: String::new(),
                    crl_sha: String::new(),
                    pem_cert_key: String::from_utf8_lossy(&bundle).into_owned(),
                    pem_file: Some(pem_file.clone()),
                    ca_file: None,
                    crl_file: None,
                };
                files.push((pem_file, bundle));
                rec
            }
            (None, None) if m.ca.is_some() => CertificateRecord {
                key: key.to_string(),
                uid: uid.to_string(),
                common_names: BTreeSet::new(),
                expires: DateTime::<Utc>::MIN_UTC,
                pem_sha: String::new(),
                ca_sha: String::new(),
                crl_sha: String::new(),
                pem_cert_key: String::new(),
                pem_file: None,
                ca_file: None,
                crl_file: None,
            },
            _ => return Err(CertError::NoMaterial),
        };
        if let Some(ca) = &m.ca {
            let expiries = check_ca(ca)?;
            if rec.pem_file.is_none() {
                rec.expires = expiries.iter().copied().min().unwrap_or(rec.expires);
            }
            let path = self.cfg.ssl_dir.join(format!("ca-{stem}.pem"));
            rec.ca_sha = sha256_hex(ca);
            rec.ca_file = Some(path.clone());
            files.push((path, ca.clone()));
        }
        if let Some(crl) = &m.crl {
            if m.ca.is_none() { return Err(CertError::CrlWithoutCa); }
            check_crl(crl)?;
            let path = self.cfg.ssl_dir.join(format!("crl-{stem}.pem"));
            rec.crl_sha = sha256_hex(crl);
            rec.crl_file = Some(path.clone());
            files.push((path, crl.clone()));
        }

        // equality ignores the bundle, but a chain-only change still has to reach the disk
        let unchanged = self.read().get(key).is_some_and(|old| {
            *old == rec && old.crl_sha == rec.crl_sha && old.pem_cert_key == rec.pem_cert_key
        });
        if unchanged {
            debug!(secret = %key, "certificate unchanged");
            return Ok(rec);
        }
        replace_all(&files)?;
        info!(secret = %key, names = ?rec.common_names, expires = %rec.expires, "certificate stored");
        counter!("cert_updates_total", 1u64);
        self.write().insert(key.to_string(), rec.clone());
        Ok(rec)
    }

    async fn maybe_complete(&self, key: &str, cert: &[u8]) -> Vec<u8> {
        let Some(f) = &self.fetcher else { return cert.to_vec() };
        match f.complete(cert).await {
            Ok(Some(full)) => {
                info!(secret = %key, "completed certificate chain");
                full
            }
            Ok(None) => cert.to_vec(),
            Err(e) => {
                warn!(secret = %key, error = %e, "error generating certificate chain; using original");
                counter!("cert_chain_failures_total", 1u64);
                cert.to_vec()
            }
        }
    }

    pub fn get(&self, key: &str) -> Result<CertificateRecord, CertError> {
        self.read().get(key).cloned().ok_or_else(|| CertError::NotFound(key.to_string()))
    }

    pub fn delete(&self, key: &str) -> Option<CertificateRecord> {
        let removed = self.write().remove(key);
        if removed.is_some() { debug!(secret = %key, "certificate removed"); }
        removed
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
