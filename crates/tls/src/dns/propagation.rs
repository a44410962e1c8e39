//! DNS propagation checking for DNS-01 challenges
//!
//! Queries the configured recursive nameservers until the challenge TXT
//! record shows the expected value, so the CA is only told to validate once
//! the record is visible.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::provider::{challenge_record_fqdn, DnsProviderError};

/// Configuration for propagation checking
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Delay before first check
    pub initial_delay: Duration,
    /// Interval between checks
    pub check_interval: Duration,
    /// Maximum time to wait for propagation
    pub timeout: Duration,
    /// Nameservers to query (empty = system defaults)
    pub nameservers: Vec<IpAddr>,
}

impl PropagationConfig {
    pub fn new(nameservers: Vec<IpAddr>, timeout: Duration) -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            check_interval: Duration::from_secs(5),
            timeout,
            nameservers,
        }
    }
}

/// DNS propagation checker
#[derive(Debug)]
pub struct PropagationChecker {
    config: PropagationConfig,
    resolver: TokioResolver,
}

impl PropagationChecker {
    pub fn with_config(config: PropagationConfig) -> Result<Self, DnsProviderError> {
        let resolver = Self::create_resolver(&config)?;
        Ok(Self { config, resolver })
    }

    fn create_resolver(config: &PropagationConfig) -> Result<TokioResolver, DnsProviderError> {
        let resolver_config = if config.nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut resolver_config = ResolverConfig::new();
            for ip in &config.nameservers {
                resolver_config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*ip, 53),
                    Protocol::Udp,
                ));
            }
            resolver_config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 3;
        // A cached negative answer would hide the new record
        opts.cache_size = 0;

        let resolver =
            Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();
        Ok(resolver)
    }

    /// Wait until the challenge record for `domain` carries `expected_value`
    pub async fn wait_for_propagation(
        &self,
        domain: &str,
        expected_value: &str,
    ) -> Result<(), DnsProviderError> {
        let record_name = challenge_record_fqdn(domain);
        let start = Instant::now();
        let deadline = start + self.config.timeout;

        debug!(
            record = %record_name,
            nameservers = ?self.config.nameservers,
            timeout_secs = self.config.timeout.as_secs(),
            "Waiting for DNS propagation"
        );

        tokio::time::sleep(self.config.initial_delay).await;

        loop {
            match self.check_record(&record_name, expected_value).await {
                Ok(true) => {
                    debug!(
                        record = %record_name,
                        elapsed_secs = start.elapsed().as_secs(),
                        "DNS propagation confirmed"
                    );
                    return Ok(());
                }
                Ok(false) => {
                    trace!(record = %record_name, "Record not yet propagated");
                }
                Err(e) => {
                    warn!(record = %record_name, error = %e, "DNS lookup error");
                }
            }

            if Instant::now() > deadline {
                return Err(DnsProviderError::Timeout {
                    elapsed_secs: self.config.timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    async fn check_record(
        &self,
        record_name: &str,
        expected_value: &str,
    ) -> Result<bool, DnsProviderError> {
        match self.resolver.txt_lookup(record_name).await {
            Ok(records) => {
                let found = records.iter().any(|record| {
                    // A TXT record may be split into several strings
                    let value: String = record
                        .txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect();
                    trace!(record = %record_name, found_value = %value, "Checking TXT record");
                    value == expected_value
                });
                Ok(found)
            }
            Err(e) => {
                let err_str = e.to_string().to_lowercase();
                if err_str.contains("no records found")
                    || err_str.contains("nxdomain")
                    || err_str.contains("record not found")
                {
                    Ok(false)
                } else {
                    Err(DnsProviderError::ApiRequest(format!(
                        "DNS lookup failed for '{}': {}",
                        record_name, e
                    )))
                }
            }
        }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }
}
