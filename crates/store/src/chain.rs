//! Best-effort completion of certificate chains through Authority Information Access URLs.

use std::time::Duration;

use ::pem::Pem;
use tracing::debug;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::oid_registry::OID_PKIX_ACCESS_DESCRIPTOR_CA_ISSUERS;
use x509_parser::prelude::FromDer;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("invalid certificate: {0}")]
    Parse(String),
    #[error("certificate carries no caIssuers URL")]
    NoIssuerUrl,
    #[error("fetching issuer from {url}: {source}")]
    Fetch { url: String, source: reqwest::Error },
}

fn is_self_issued(cert: &X509Certificate<'_>) -> bool { cert.subject().as_raw() == cert.issuer().as_raw() }

fn issuer_url(cert: &X509Certificate<'_>) -> Option<String> {
    cert.extensions().iter().find_map(|ext| match ext.parsed_extension() {
        ParsedExtension::AuthorityInfoAccess(aia) => aia.accessdescs.iter().find_map(|d| {
            match (&d.access_location, d.access_method == OID_PKIX_ACCESS_DESCRIPTOR_CA_ISSUERS) {
                (GeneralName::URI(uri), true) if uri.starts_with("http") => Some(uri.to_string()),
                _ => None,
            }
        }),
        _ => None,
    })
}

fn parse_der(der: &[u8]) -> Result<X509Certificate<'_>, ChainError> {
    X509Certificate::from_der(der).map(|(_, c)| c).map_err(|e| ChainError::Parse(e.to_string()))
}

/// Issuers are served either DER-encoded or as a PEM block.
fn decode_issuer(body: &[u8]) -> Result<Vec<u8>, ChainError> {
    if body.starts_with(b"-----BEGIN") {
        return ::pem::parse(body).map(|p| p.into_contents()).map_err(|e| ChainError::Parse(e.to_string()));
    }
    Ok(body.to_vec())
}

pub struct ChainFetcher {
    http: reqwest::Client,
    max_depth: usize,
}

impl ChainFetcher {
    pub fn new(timeout: Duration, max_depth: usize) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, max_depth })
    }

    /// Append missing intermediates to a PEM holding a single leaf.
    ///
    /// Returns `Ok(None)` when nothing needs to be (or could be) appended: bundles that already
    /// carry more than one certificate, self-issued leaves, and chains ending at a root.
    pub async fn complete(&self, bundle: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        let blocks = ::pem::parse_many(bundle).map_err(|e| ChainError::Parse(e.to_string()))?;
        let certs: Vec<Pem> = blocks.into_iter().filter(|b| b.tag() == "CERTIFICATE").collect();
        if certs.len() != 1 { return Ok(None); }
        let mut current = certs[0].contents().to_vec();
        {
            let leaf = parse_der(&current)?;
            if is_self_issued(&leaf) { return Ok(None); }
            if issuer_url(&leaf).is_none() { return Err(ChainError::NoIssuerUrl); }
        }
        let mut chain = certs;
        for _ in 0..self.max_depth {
            let Some(url) = issuer_url(&parse_der(&current)?) else { break };
            let der = decode_issuer(&self.fetch(&url).await?)?;
            if is_self_issued(&parse_der(&der)?) {
                debug!(url = %url, "reached self-issued root; not appending");
                break;
            }
            debug!(url = %url, "fetched intermediate");
            chain.push(Pem::new("CERTIFICATE", der.clone()));
            current = der;
        }
        if chain.len() == 1 { return Ok(None); }
        Ok(Some(::pem::encode_many(&chain).into_bytes()))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ChainError> {
        let err = |source| ChainError::Fetch { url: url.to_string(), source };
        let resp = self.http.get(url).send().await.map_err(err)?.error_for_status().map_err(err)?;
        Ok(resp.bytes().await.map_err(err)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    #[tokio::test]
    async fn self_signed_leaf_needs_no_completion() {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["a.example".into()]).unwrap().self_signed(&key).unwrap();
        let f = ChainFetcher::new(DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_DEPTH).unwrap();
        assert!(f.complete(cert.pem().as_bytes()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leaf_without_aia_is_an_error() {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.distinguished_name.push(rcgen::DnType::CommonName, "test ca");
        let ca = ca_params.self_signed(&ca_key).unwrap();
        let leaf_key = KeyPair::generate().unwrap();
        let leaf = CertificateParams::new(vec!["b.example".into()]).unwrap().signed_by(&leaf_key, &ca, &ca_key).unwrap();
        let f = ChainFetcher::new(DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_DEPTH).unwrap();
        assert!(matches!(f.complete(leaf.pem().as_bytes()).await, Err(ChainError::NoIssuerUrl)));
    }
}
