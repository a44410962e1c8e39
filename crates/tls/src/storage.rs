//! Certificate material output
//!
//! Every issued certificate lands in three files named after the first
//! domain: `<domain>.key`, `<domain>.crt` and `<domain>.issuer.crt`.

use crate::error::TlsError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use x509_parser::prelude::*;

/// Leaf key, certificate and issuer chain as PEM
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    /// Leaf private key. Never the account key.
    pub private_key: String,
    /// Leaf certificate followed by its chain
    pub certificate: String,
    /// Issuer certificates only
    pub issuer_certificate: String,
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("has_private_key", &!self.private_key.is_empty())
            .field("certificate_len", &self.certificate.len())
            .field("issuer_certificate_len", &self.issuer_certificate.len())
            .finish()
    }
}

/// Split a PEM chain into the leaf and the remaining issuer certificates
pub fn split_chain(chain_pem: &str) -> Result<(String, String), TlsError> {
    let blocks = ::pem::parse_many(chain_pem)
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse PEM chain: {}", e)))?;

    let mut blocks = blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE");
    let leaf = blocks
        .next()
        .ok_or_else(|| TlsError::CertificateError("Chain contains no certificate".to_string()))?;
    let issuers: Vec<_> = blocks.collect();

    Ok((::pem::encode(&leaf), ::pem::encode_many(&issuers)))
}

/// Facts read from a leaf certificate
#[derive(Debug, Clone)]
pub struct CertInfo {
    /// DNS names from the subject alternative names
    pub domains: Vec<String>,
    /// Start of validity, logged when a chain is downloaded
    pub not_before: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CertInfo {
    /// Get remaining validity in days
    pub fn remaining_days(&self) -> i64 {
        (self.expires_at - Utc::now()).num_days()
    }

    /// Check if certificate expires within the given number of days
    pub fn expires_within_days(&self, days: i64) -> bool {
        let threshold = Utc::now() + chrono::Duration::days(days);
        self.expires_at <= threshold
    }
}

/// Parse the first certificate in a PEM document
pub fn parse_certificate(cert_pem: &str) -> Result<CertInfo, TlsError> {
    let block = ::pem::parse(cert_pem)
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse PEM: {}", e)))?;

    let (_, cert) = X509Certificate::from_der(block.contents())
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse X509: {:?}", e)))?;

    let mut domains = Vec::new();
    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                let dns = dns.to_string();
                if !domains.contains(&dns) {
                    domains.push(dns);
                }
            }
        }
    }

    let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or_else(|| TlsError::CertificateError("Invalid not-before timestamp".to_string()))?;
    let expires_at = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| TlsError::CertificateError("Invalid expiry timestamp".to_string()))?;

    Ok(CertInfo {
        domains,
        not_before,
        expires_at,
    })
}

/// Output file locations for one domain set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialPaths {
    pub private_key: PathBuf,
    pub certificate: PathBuf,
    pub issuer_certificate: PathBuf,
}

/// Writes certificate material under one directory
#[derive(Debug, Clone)]
pub struct CertStorage {
    base_path: PathBuf,
}

impl CertStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the output file paths for a domain.
    /// `with_extension` is avoided since it would eat the last label.
    pub fn material_paths(&self, domain: &str) -> MaterialPaths {
        MaterialPaths {
            private_key: self.base_path.join(format!("{}.key", domain)),
            certificate: self.base_path.join(format!("{}.crt", domain)),
            issuer_certificate: self.base_path.join(format!("{}.issuer.crt", domain)),
        }
    }

    /// Write the key, certificate and issuer files, in that order
    pub async fn write_material(
        &self,
        domain: &str,
        material: &CertificateMaterial,
    ) -> Result<MaterialPaths, TlsError> {
        let paths = self.material_paths(domain);

        fs::create_dir_all(&self.base_path)
            .await
            .map_err(|source| TlsError::OutputWrite {
                kind: "output directory",
                domain: domain.to_string(),
                path: self.base_path.clone(),
                source,
            })?;

        write_output(domain, "private key", &paths.private_key, &material.private_key).await?;

        // Set restrictive permissions on private key (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = fs::set_permissions(&paths.private_key, permissions).await {
                tracing::warn!(path = ?paths.private_key, error = %e, "Failed to set key file permissions");
            }
        }

        write_output(domain, "certificate", &paths.certificate, &material.certificate).await?;
        write_output(
            domain,
            "issuer certificate",
            &paths.issuer_certificate,
            &material.issuer_certificate,
        )
        .await?;

        info!(
            domain = %domain,
            certificate = ?paths.certificate,
            "Certificate files written"
        );
        Ok(paths)
    }

    /// Read the saved leaf certificate, if there is one
    pub async fn load_certificate_info(&self, domain: &str) -> Result<Option<CertInfo>, TlsError> {
        let path = self.material_paths(domain).certificate;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?path, "No saved certificate");
                return Ok(None);
            }
            Err(e) => {
                return Err(TlsError::CertificateError(format!(
                    "Failed to read {:?}: {}",
                    path, e
                )))
            }
        };

        parse_certificate(&content).map(Some)
    }
}

async fn write_output(
    domain: &str,
    kind: &'static str,
    path: &Path,
    content: &str,
) -> Result<(), TlsError> {
    fs::write(path, content)
        .await
        .map_err(|source| TlsError::OutputWrite {
            kind,
            domain: domain.to_string(),
            path: path.to_path_buf(),
            source,
        })?;
    debug!(domain = %domain, kind = kind, path = ?path, "Wrote output file");
    Ok(())
}
