//! TLS error types
//!
//! Every variant is fatal for the current run. Nothing here is retried.

use crate::dns::DnsProviderError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to {action} account key {path:?}: {source}")]
    KeyIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse account key {path:?}: {message}")]
    KeyParse { path: PathBuf, message: String },

    #[error("Failed to generate key: {0}")]
    KeyGeneration(String),

    #[error("Failed to {action} tracking record {path:?}: {source}")]
    LedgerIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed tracking record {path:?}: {source}")]
    LedgerParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("ACME {operation} failed: {message}")]
    Acme {
        operation: &'static str,
        message: String,
    },

    #[error("Failed to write {kind} for {domain} to {path:?}: {source}")]
    OutputWrite {
        kind: &'static str,
        domain: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("DNS provider error: {0}")]
    Dns(#[from] DnsProviderError),

    #[error("Certificate error: {0}")]
    CertificateError(String),
}

impl TlsError {
    pub(crate) fn acme(operation: &'static str, err: impl std::fmt::Display) -> Self {
        TlsError::Acme {
            operation,
            message: err.to_string(),
        }
    }
}
