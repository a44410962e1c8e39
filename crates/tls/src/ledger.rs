//! Certificate tracking records
//!
//! One JSON document per domain set, named after the first domain:
//! `<dir>/<first-domain>.json`. Its presence means a certificate was issued
//! before and the next run should renew it.

use crate::error::TlsError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Pointer to a certificate held by the ACME server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRecord {
    /// Location the certificate can be fetched from again
    pub cert_url: String,
    /// Long-lived certificate location reported by the CA
    pub cert_stable_url: String,
}

/// Reads and writes tracking records under one directory
#[derive(Debug, Clone)]
pub struct CertificateLedger {
    dir: PathBuf,
}

impl CertificateLedger {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the record for a tracking key (the first domain)
    pub fn path(&self, tracking_key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", tracking_key))
    }

    /// Load a record. A missing file is `None`, a malformed one is an error.
    pub async fn load(&self, tracking_key: &str) -> Result<Option<TrackingRecord>, TlsError> {
        let path = self.path(tracking_key);

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(TlsError::LedgerIo {
                    action: "read",
                    path,
                    source,
                })
            }
        };

        let record = serde_json::from_slice(&content)
            .map_err(|source| TlsError::LedgerParse { path: path.clone(), source })?;

        debug!(path = ?path, "Loaded tracking record");
        Ok(Some(record))
    }

    /// Replace the record. The new content is written to a sibling
    /// temporary file and renamed over the old one.
    pub async fn save(&self, tracking_key: &str, record: &TrackingRecord) -> Result<(), TlsError> {
        let path = self.path(tracking_key);
        let tmp_path = self.dir.join(format!(".{}.json.tmp", tracking_key));

        let content = serde_json::to_vec(record)
            .map_err(|source| TlsError::LedgerParse { path: path.clone(), source })?;

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| TlsError::LedgerIo {
                action: "create directory for",
                path: path.clone(),
                source,
            })?;

        fs::write(&tmp_path, &content)
            .await
            .map_err(|source| TlsError::LedgerIo {
                action: "write",
                path: tmp_path.clone(),
                source,
            })?;

        if let Err(source) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TlsError::LedgerIo {
                action: "replace",
                path,
                source,
            });
        }

        debug!(path = ?path, "Saved tracking record");
        Ok(())
    }
}
