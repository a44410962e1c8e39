//! tls: ACME account and certificate lifecycle for autocert
//!
//! This crate keeps an ACME account key on disk, issues or renews a
//! certificate over DNS-01 with Aliyun DNS, and writes the certificate
//! material plus a small tracking record next to it.

pub mod account;
pub mod client;
pub mod dns;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod storage;

pub use account::{AccountIdentity, AccountKey, IdentityKeyManager, Registration, ResolvedKey};
pub use client::{
    AcmeClient, CertificateKeyType, CertificateResource, Dns01Options, InstantAcmeClient,
    ObtainRequest,
};
pub use dns::{AliyunDnsProvider, DnsProvider, DnsProviderError};
pub use error::TlsError;
pub use ledger::{CertificateLedger, TrackingRecord};
pub use lifecycle::{
    AccountAction, CertificateAction, LifecycleOrchestrator, LifecyclePlan, LifecycleState,
    RunOutcome, RunRequest,
};
pub use storage::{CertInfo, CertStorage, CertificateMaterial, MaterialPaths};

// ============================================================================
// ACME Certificate Authority URLs
// ============================================================================
//
// Only CAs that accept new accounts without external account binding are
// listed. Anything else can still be reached by directory URL.

/// Let's Encrypt production CA
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging CA (for testing)
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Buypass production CA
pub const BUYPASS_PRODUCTION: &str = "https://api.buypass.com/acme/directory";

/// Buypass test CA
pub const BUYPASS_STAGING: &str = "https://api.test4.buypass.no/acme/directory";

/// Resolve an ACME directory URL from a CA alias or a direct URL
///
/// Aliases (case-insensitive): `letsencrypt`/`le`, `letsencrypt-staging`/
/// `le-staging`/`staging`, `buypass` and `buypass-staging`. Anything
/// starting with `http://` or `https://` is used as given, and an empty
/// value selects Let's Encrypt production.
pub fn resolve_acme_ca(alias_or_url: &str) -> String {
    let normalized = alias_or_url.trim().to_lowercase();

    if normalized.starts_with("http://") || normalized.starts_with("https://") {
        return alias_or_url.trim().to_string();
    }

    match normalized.as_str() {
        "" | "letsencrypt" | "le" => LETS_ENCRYPT_PRODUCTION.to_string(),
        "letsencrypt-staging" | "le-staging" | "staging" => LETS_ENCRYPT_STAGING.to_string(),
        "buypass" => BUYPASS_PRODUCTION.to_string(),
        "buypass-staging" => BUYPASS_STAGING.to_string(),
        _ => {
            tracing::warn!(
                ca = %alias_or_url,
                "Unknown ACME CA alias, defaulting to Let's Encrypt"
            );
            LETS_ENCRYPT_PRODUCTION.to_string()
        }
    }
}

/// Human-readable name for an ACME directory URL
pub fn ca_display_name(url: &str) -> &'static str {
    match url {
        LETS_ENCRYPT_PRODUCTION => "Let's Encrypt",
        LETS_ENCRYPT_STAGING => "Let's Encrypt (Staging)",
        BUYPASS_PRODUCTION => "Buypass",
        BUYPASS_STAGING => "Buypass (Test)",
        _ => "Custom CA",
    }
}
