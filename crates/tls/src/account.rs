//! ACME account identity and the persisted account key
//!
//! The key file is the only record of an account. If it exists the account
//! is assumed to be registered with the CA already, otherwise a fresh key is
//! generated and a new account will be registered for it.

use crate::error::TlsError;
use aws_lc_rs::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use rcgen::{KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// ECDSA P-256 account key held as PKCS#8
#[derive(Clone)]
pub struct AccountKey {
    pem: String,
    pkcs8_der: Vec<u8>,
}

impl AccountKey {
    /// Generate a new P-256 key
    pub fn generate() -> Result<Self, TlsError> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| TlsError::KeyGeneration(e.to_string()))?;
        Ok(Self {
            pem: key_pair.serialize_pem(),
            pkcs8_der: key_pair.serialize_der(),
        })
    }

    /// Parse a P-256 key from PEM, either PKCS#8 (`PRIVATE KEY`) or SEC1
    /// (`EC PRIVATE KEY`). SEC1 keys are re-encoded as PKCS#8 in memory; the
    /// PEM text is kept as read. `path` is only used for error reporting.
    pub fn from_pem(path: &Path, pem: &str) -> Result<Self, TlsError> {
        let parse_error = |message: String| TlsError::KeyParse {
            path: path.to_path_buf(),
            message,
        };

        let block = pem::parse(pem).map_err(|e| parse_error(e.to_string()))?;
        match block.tag() {
            "PRIVATE KEY" | "EC PRIVATE KEY" => {}
            other => return Err(parse_error(format!("unsupported key block '{}'", other))),
        }

        let key_pair =
            EcdsaKeyPair::from_private_key_der(&ECDSA_P256_SHA256_FIXED_SIGNING, block.contents())
                .map_err(|e| parse_error(format!("account key is not an ECDSA P-256 key: {}", e)))?;
        let pkcs8 = key_pair
            .to_pkcs8v1()
            .map_err(|_| parse_error("failed to encode key as PKCS#8".to_string()))?;

        Ok(Self {
            pem: pem.to_string(),
            pkcs8_der: pkcs8.as_ref().to_vec(),
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_der
    }

    /// Signing key in the form the ACME client expects
    pub fn to_acme_key(&self) -> Result<(instant_acme::Key, PrivateKeyDer<'static>), TlsError> {
        let key = instant_acme::Key::from_pkcs8_der(PrivatePkcs8KeyDer::from(
            self.pkcs8_der.as_slice(),
        ))
        .map_err(|e| TlsError::KeyGeneration(e.to_string()))?;
        let der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.pkcs8_der.clone()));
        Ok((key, der))
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey").finish_non_exhaustive()
    }
}

/// Server-side account resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub account_url: String,
}

/// The ACME user: contact email, account key and, once registered or
/// resolved, the server-side account handle
#[derive(Debug, Clone)]
pub struct AccountIdentity {
    email: String,
    key: AccountKey,
    registration: Option<Registration>,
}

impl AccountIdentity {
    pub fn new(email: impl Into<String>, key: AccountKey) -> Self {
        Self {
            email: email.into(),
            key,
            registration: None,
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn private_key(&self) -> &AccountKey {
        &self.key
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// Attach the handle returned by registration or resolution
    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }
}

/// Key path used when none is configured:
/// `.lego/accounts/<ca-host>/<email>/keys/<email>.key`
pub fn default_key_path(ca_dir_url: &str, email: &str) -> PathBuf {
    let host = match reqwest::Url::parse(ca_dir_url) {
        Ok(url) => match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}_{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => sanitize_path_segment(ca_dir_url),
        },
        Err(_) => sanitize_path_segment(ca_dir_url),
    };

    PathBuf::from(".lego")
        .join("accounts")
        .join(host)
        .join(email)
        .join("keys")
        .join(format!("{}.key", email))
}

fn sanitize_path_segment(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Result of resolving the account key
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub key: AccountKey,
    /// True when the key was generated during this call
    pub is_new: bool,
}

/// Loads the account key from disk or creates it
#[derive(Debug, Clone)]
pub struct IdentityKeyManager {
    path: PathBuf,
}

impl IdentityKeyManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Use the configured path, or the default one derived from the email
    pub fn from_settings(private_key_path: Option<&Path>, ca_dir_url: &str, email: &str) -> Self {
        match private_key_path {
            Some(path) => Self::new(path),
            None => Self::new(default_key_path(ca_dir_url, email)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the key if the file exists, otherwise generate and persist one
    pub async fn resolve_or_create(&self) -> Result<ResolvedKey, TlsError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|source| self.io_error("stat", source))?;

        if exists {
            let pem = fs::read_to_string(&self.path)
                .await
                .map_err(|source| self.io_error("read", source))?;
            let key = AccountKey::from_pem(&self.path, &pem)?;
            debug!(path = ?self.path, "Loaded existing account key");
            return Ok(ResolvedKey { key, is_new: false });
        }

        let key = AccountKey::generate()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| self.io_error("create directory for", source))?;
            }
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
            .map_err(|source| self.io_error("create", source))?;
        file.write_all(key.pem().as_bytes())
            .await
            .map_err(|source| self.io_error("write", source))?;
        file.flush()
            .await
            .map_err(|source| self.io_error("write", source))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = fs::set_permissions(&self.path, permissions).await {
                tracing::warn!(path = ?self.path, error = %e, "Failed to set key file permissions");
            }
        }

        info!(path = ?self.path, "Generated new account key");
        Ok(ResolvedKey { key, is_new: true })
    }

    fn io_error(&self, action: &'static str, source: std::io::Error) -> TlsError {
        TlsError::KeyIo {
            action,
            path: self.path.clone(),
            source,
        }
    }
}
