//! DNS-01 challenge support
//!
//! - [`DnsProvider`] - Trait for DNS provider implementations
//! - [`AliyunDnsProvider`] - Aliyun DNS (Alidns) API
//! - [`PropagationChecker`] - Verifies DNS propagation before validation

mod aliyun;
mod propagation;
mod provider;

pub use aliyun::{AliyunDnsProvider, ALIYUN_DNS_ENDPOINT};
pub use propagation::{PropagationChecker, PropagationConfig};
pub use provider::{
    challenge_record_fqdn, normalize_domain, DnsProvider, DnsProviderError, DnsResult,
    ACME_CHALLENGE_RECORD, CHALLENGE_TTL,
};

#[cfg(test)]
pub(crate) use provider::mock::MockDnsProvider;
