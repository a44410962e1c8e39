//! DNS provider trait for DNS-01 challenges

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

/// Result type for DNS operations
pub type DnsResult<T> = Result<T, DnsProviderError>;

/// Errors that can occur during DNS provider operations
#[derive(Debug, Error)]
pub enum DnsProviderError {
    /// Authentication failed with the DNS provider
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Zone not found for the domain
    #[error("Zone not found for domain '{domain}'")]
    ZoneNotFound { domain: String },

    /// Record creation failed
    #[error("Failed to create TXT record for '{record_name}': {message}")]
    RecordCreation { record_name: String, message: String },

    /// Record deletion failed
    #[error("Failed to delete TXT record '{record_id}': {message}")]
    RecordDeletion { record_id: String, message: String },

    /// API request failed
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Propagation or request timeout
    #[error("Timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

/// A DNS service that can publish and withdraw challenge TXT records
#[async_trait]
pub trait DnsProvider: Send + Sync + Debug {
    /// Returns the provider name (e.g. "aliyun")
    fn name(&self) -> &'static str;

    /// Create a TXT record `{record_name}.{domain}` holding `record_value`.
    /// Returns the provider's record ID for cleanup.
    async fn create_txt_record(
        &self,
        domain: &str,
        record_name: &str,
        record_value: &str,
    ) -> DnsResult<String>;

    /// Delete a record created by `create_txt_record`.
    /// Deleting a record that is already gone is not an error.
    async fn delete_txt_record(&self, domain: &str, record_id: &str) -> DnsResult<()>;

    /// How long to wait for a new record to become visible
    fn propagation_timeout(&self) -> Duration;
}

/// ACME challenge record name prefix
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// TTL for challenge records, the lowest the provider accepts on basic plans
pub const CHALLENGE_TTL: u32 = 600;

/// Strip a wildcard prefix. The zone lookup is done by the provider.
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// Build the full ACME challenge record name
///
/// For `example.com`, returns `_acme-challenge.example.com`
/// For `*.example.com`, returns `_acme-challenge.example.com`
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_RECORD, normalize_domain(domain))
}
