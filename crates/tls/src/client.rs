//! ACME client seam and its instant-acme implementation
//!
//! [`AcmeClient`] is everything the lifecycle needs from a CA:
//! account registration or lookup, issuance, fetching a tracked
//! certificate and renewing it. [`InstantAcmeClient`] implements it with
//! DNS-01 challenges published through a [`DnsProvider`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountBuilder, AuthorizationStatus, ChallengeType, HttpClient, Identifier,
    NewOrder, Order, OrderStatus,
};
use tracing::{debug, error, info, trace, warn};

use crate::account::{AccountIdentity, Registration};
use crate::dns::{DnsProvider, PropagationChecker, PropagationConfig, ACME_CHALLENGE_RECORD};
use crate::error::TlsError;
use crate::ledger::TrackingRecord;
use crate::storage::{parse_certificate, split_chain, CertificateMaterial};

#[cfg(test)]
mod scripted_ca;

/// How long the CA gets to validate challenges once they are marked ready
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);

/// How long the CA gets to issue after finalization
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(60);

/// DNS-01 settings applied when the provider is attached
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dns01Options {
    /// Recursive nameservers used to confirm propagation (empty = system)
    pub nameservers: Vec<IpAddr>,
    /// Tell the CA to validate as soon as the record is created
    pub skip_propagation_check: bool,
}

/// Key algorithm for issued certificates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CertificateKeyType {
    #[default]
    Rsa2048,
    Ec256,
}

impl CertificateKeyType {
    fn generate(self) -> Result<rcgen::KeyPair, TlsError> {
        let alg = match self {
            CertificateKeyType::Rsa2048 => &rcgen::PKCS_RSA_SHA256,
            CertificateKeyType::Ec256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        };
        rcgen::KeyPair::generate_for(alg).map_err(|e| TlsError::KeyGeneration(e.to_string()))
    }
}

/// Issuance request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObtainRequest {
    pub domains: Vec<String>,
    /// Put the issuer chain after the leaf in `certificate`
    pub bundle: bool,
}

/// A certificate as known to the CA, plus whatever material came with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateResource {
    /// Names on the certificate
    pub domains: Vec<String>,
    pub cert_url: String,
    pub cert_stable_url: String,
    /// Leaf key. Only present on freshly issued certificates.
    pub private_key: Option<String>,
    pub certificate: String,
    pub issuer_certificate: String,
}

impl CertificateResource {
    pub fn tracking_record(&self) -> TrackingRecord {
        TrackingRecord {
            cert_url: self.cert_url.clone(),
            cert_stable_url: self.cert_stable_url.clone(),
        }
    }

    /// Material ready to be written out. Fails if there is no leaf key.
    pub fn into_material(self) -> Result<CertificateMaterial, TlsError> {
        let private_key = self.private_key.ok_or_else(|| {
            TlsError::CertificateError(format!(
                "Certificate {} carries no private key",
                self.cert_url
            ))
        })?;
        Ok(CertificateMaterial {
            private_key,
            certificate: self.certificate,
            issuer_certificate: self.issuer_certificate,
        })
    }
}

/// Operations the lifecycle needs from an ACME CA
#[async_trait]
pub trait AcmeClient: Send {
    /// Attach the DNS-01 provider. Must be called once, before any
    /// certificate operation.
    fn configure_dns01(
        &mut self,
        provider: Arc<dyn DnsProvider>,
        options: Dns01Options,
    ) -> Result<(), TlsError>;

    /// Register a new account for the identity's key
    async fn register_account(
        &mut self,
        identity: &AccountIdentity,
        agree_to_terms: bool,
    ) -> Result<Registration, TlsError>;

    /// Look up the account already registered for the identity's key
    async fn resolve_account_by_key(
        &mut self,
        identity: &AccountIdentity,
    ) -> Result<Registration, TlsError>;

    /// Issue a certificate with a freshly generated leaf key
    async fn obtain_certificate(
        &mut self,
        request: &ObtainRequest,
    ) -> Result<CertificateResource, TlsError>;

    /// Download a previously issued certificate by its tracking URL
    async fn fetch_certificate(
        &mut self,
        cert_url: &str,
        exclude_private_key: bool,
    ) -> Result<CertificateResource, TlsError>;

    /// Issue a replacement for `resource`
    async fn renew_certificate(
        &mut self,
        resource: &CertificateResource,
        bundle: bool,
    ) -> Result<CertificateResource, TlsError>;
}

struct Dns01Handler {
    provider: Arc<dyn DnsProvider>,
    /// None when propagation checks are skipped
    checker: Option<PropagationChecker>,
}

type HttpClientFactory = Box<dyn Fn() -> Box<dyn HttpClient> + Send + Sync>;

/// [`AcmeClient`] backed by instant-acme
pub struct InstantAcmeClient {
    directory_url: String,
    key_type: CertificateKeyType,
    http: Option<HttpClientFactory>,
    account: Option<Account>,
    dns01: Option<Dns01Handler>,
}

impl InstantAcmeClient {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            key_type: CertificateKeyType::default(),
            http: None,
            account: None,
            dns01: None,
        }
    }

    /// Key algorithm for certificates issued by this client
    pub fn with_key_type(mut self, key_type: CertificateKeyType) -> Self {
        self.key_type = key_type;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_http_client<F>(directory_url: impl Into<String>, http: F) -> Self
    where
        F: Fn() -> Box<dyn HttpClient> + Send + Sync + 'static,
    {
        let mut client = Self::new(directory_url);
        client.http = Some(Box::new(http));
        client
    }

    fn account_builder(&self, operation: &'static str) -> Result<AccountBuilder, TlsError> {
        match &self.http {
            Some(factory) => Ok(Account::builder_with_http(factory())),
            None => Account::builder().map_err(|e| TlsError::acme(operation, e)),
        }
    }

    fn account(&self) -> Result<&Account, TlsError> {
        self.account.as_ref().ok_or_else(|| TlsError::Acme {
            operation: "account",
            message: "no account registered or resolved".to_string(),
        })
    }

    fn dns01(&self) -> Result<&Dns01Handler, TlsError> {
        self.dns01.as_ref().ok_or_else(|| TlsError::Acme {
            operation: "challenge",
            message: "DNS-01 provider not configured".to_string(),
        })
    }

    /// Run the order, then withdraw every challenge record it published
    async fn issue(&self, request: &ObtainRequest) -> Result<CertificateResource, TlsError> {
        let account = self.account()?;
        let dns01 = self.dns01()?;

        if request.domains.is_empty() {
            return Err(TlsError::acme("order", "no domains requested"));
        }

        let mut published = Vec::new();
        let result = self.issue_inner(account, dns01, request, &mut published).await;

        for (domain, record_id) in published {
            if let Err(e) = dns01.provider.delete_txt_record(&domain, &record_id).await {
                warn!(domain = %domain, record_id = %record_id, error = %e, "Failed to clean up challenge record");
            }
        }

        result
    }

    async fn issue_inner(
        &self,
        account: &Account,
        dns01: &Dns01Handler,
        request: &ObtainRequest,
        published: &mut Vec<(String, String)>,
    ) -> Result<CertificateResource, TlsError> {
        let identifiers: Vec<Identifier> = request
            .domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        info!(domains = ?request.domains, "Creating certificate order");

        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| TlsError::acme("order", e))?;

        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result.map_err(|e| TlsError::acme("authorization", e))?;

                let domain = match &authz.identifier().identifier {
                    Identifier::Dns(domain) => domain.clone(),
                    _ => continue,
                };

                match &authz.status {
                    AuthorizationStatus::Valid => {
                        debug!(domain = %domain, "Authorization already valid");
                        continue;
                    }
                    AuthorizationStatus::Pending => {}
                    status => {
                        return Err(TlsError::acme(
                            "authorization",
                            format!("authorization for {} is {:?}", domain, status),
                        ))
                    }
                }

                let mut challenge = authz.challenge(ChallengeType::Dns01).ok_or_else(|| {
                    TlsError::acme("challenge", format!("no DNS-01 challenge offered for {}", domain))
                })?;
                let value = challenge.key_authorization().dns_value();

                let record_id = dns01
                    .provider
                    .create_txt_record(&domain, ACME_CHALLENGE_RECORD, &value)
                    .await?;
                published.push((domain.clone(), record_id));

                match &dns01.checker {
                    Some(checker) => checker.wait_for_propagation(&domain, &value).await?,
                    None => debug!(domain = %domain, "Propagation check skipped"),
                }

                challenge
                    .set_ready()
                    .await
                    .map_err(|e| TlsError::acme("challenge", e))?;
                debug!(domain = %domain, "Challenge marked ready");
            }
        }

        wait_for_order_ready(&mut order).await?;
        finalize(&mut order, request, self.key_type).await
    }
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    fn configure_dns01(
        &mut self,
        provider: Arc<dyn DnsProvider>,
        options: Dns01Options,
    ) -> Result<(), TlsError> {
        if self.dns01.is_some() {
            return Err(TlsError::acme("configure DNS-01", "already configured"));
        }

        let checker = if options.skip_propagation_check {
            warn!(
                provider = provider.name(),
                "DNS-01 propagation check disabled, the CA validates right after record creation"
            );
            None
        } else {
            let config =
                PropagationConfig::new(options.nameservers, provider.propagation_timeout());
            let checker = PropagationChecker::with_config(config)?;
            info!(
                provider = provider.name(),
                nameservers = ?checker.config().nameservers,
                timeout_secs = checker.config().timeout.as_secs(),
                "DNS-01 challenge provider configured"
            );
            Some(checker)
        };
        self.dns01 = Some(Dns01Handler { provider, checker });
        Ok(())
    }

    async fn register_account(
        &mut self,
        identity: &AccountIdentity,
        agree_to_terms: bool,
    ) -> Result<Registration, TlsError> {
        info!(email = %identity.email(), ca = %self.directory_url, "Registering ACME account");

        // instant-acme always sends termsOfServiceAgreed with a caller-held key
        if !agree_to_terms {
            return Err(TlsError::acme(
                "register",
                "the CA terms of service must be accepted to register",
            ));
        }

        let (account, _credentials) = self
            .account_builder("register")?
            .create_from_key(
                identity.private_key().to_acme_key()?,
                self.directory_url.clone(),
            )
            .await
            .map_err(|e| TlsError::acme("register", e))?;

        let contact = format!("mailto:{}", identity.email());
        account
            .update_contacts(&[contact.as_str()])
            .await
            .map_err(|e| TlsError::acme("register contact", e))?;
        debug!(contact = %contact, "Account contact set");

        let registration = Registration {
            account_url: account.id().to_string(),
        };
        info!(account = %registration.account_url, "ACME account registered");
        self.account = Some(account);
        Ok(registration)
    }

    async fn resolve_account_by_key(
        &mut self,
        identity: &AccountIdentity,
    ) -> Result<Registration, TlsError> {
        debug!(email = %identity.email(), ca = %self.directory_url, "Resolving ACME account by key");

        let (account, _credentials) = self
            .account_builder("resolve account")?
            .from_key(
                identity.private_key().to_acme_key()?,
                self.directory_url.clone(),
            )
            .await
            .map_err(|e| TlsError::acme("resolve account", e))?;

        let registration = Registration {
            account_url: account.id().to_string(),
        };
        info!(account = %registration.account_url, "ACME account resolved");
        self.account = Some(account);
        Ok(registration)
    }

    async fn obtain_certificate(
        &mut self,
        request: &ObtainRequest,
    ) -> Result<CertificateResource, TlsError> {
        self.issue(request).await
    }

    async fn fetch_certificate(
        &mut self,
        cert_url: &str,
        exclude_private_key: bool,
    ) -> Result<CertificateResource, TlsError> {
        // The CA never holds the leaf key, so there is nothing to include
        if !exclude_private_key {
            debug!("Leaf keys cannot be fetched from the CA, fetching certificate only");
        }

        let account = self.account()?;
        let mut order = account
            .order(cert_url.to_string())
            .await
            .map_err(|e| TlsError::acme("fetch certificate", e))?;

        let chain = order
            .certificate()
            .await
            .map_err(|e| TlsError::acme("fetch certificate", e))?
            .ok_or_else(|| {
                TlsError::acme(
                    "fetch certificate",
                    format!("no certificate available at {}", cert_url),
                )
            })?;

        let (_, issuer_certificate) = split_chain(&chain)?;
        let info = parse_certificate(&chain)?;
        debug!(
            cert_url = %cert_url,
            domains = ?info.domains,
            issued = %info.not_before,
            expires = %info.expires_at,
            "Fetched tracked certificate"
        );

        Ok(CertificateResource {
            domains: info.domains,
            cert_url: cert_url.to_string(),
            cert_stable_url: order
                .state()
                .certificate
                .clone()
                .unwrap_or_else(|| cert_url.to_string()),
            private_key: None,
            certificate: chain,
            issuer_certificate,
        })
    }

    async fn renew_certificate(
        &mut self,
        resource: &CertificateResource,
        bundle: bool,
    ) -> Result<CertificateResource, TlsError> {
        info!(domains = ?resource.domains, previous = %resource.cert_url, "Renewing certificate");
        self.issue(&ObtainRequest {
            domains: resource.domains.clone(),
            bundle,
        })
        .await
    }
}

/// Poll the order until every authorization has been validated
async fn wait_for_order_ready(order: &mut Order) -> Result<(), TlsError> {
    let deadline = tokio::time::Instant::now() + CHALLENGE_TIMEOUT;

    loop {
        let state = order
            .refresh()
            .await
            .map_err(|e| TlsError::acme("order", e))?;

        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => {
                info!("Order is ready for finalization");
                return Ok(());
            }
            OrderStatus::Invalid => {
                error!("Order became invalid");
                return Err(TlsError::acme("order", "order became invalid"));
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                if tokio::time::Instant::now() > deadline {
                    return Err(TlsError::acme(
                        "order",
                        "timed out waiting for challenge validation",
                    ));
                }
                trace!(status = ?state.status, "Order not ready yet, waiting");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Submit a CSR for a new leaf key and download the issued chain
async fn finalize(
    order: &mut Order,
    request: &ObtainRequest,
    key_type: CertificateKeyType,
) -> Result<CertificateResource, TlsError> {
    let cert_key = key_type.generate()?;
    debug!(key_type = ?key_type, "Generated certificate key");

    let csr = rcgen::CertificateParams::new(request.domains.clone())
        .and_then(|params| params.serialize_request(&cert_key))
        .map_err(|e| TlsError::acme("finalize", format!("failed to build CSR: {}", e)))?
        .der()
        .to_vec();

    order
        .finalize_csr(&csr)
        .await
        .map_err(|e| TlsError::acme("finalize", e))?;

    let deadline = tokio::time::Instant::now() + ISSUANCE_TIMEOUT;
    let chain = loop {
        let state = order
            .refresh()
            .await
            .map_err(|e| TlsError::acme("finalize", e))?;

        match state.status {
            OrderStatus::Valid => {
                let chain = order
                    .certificate()
                    .await
                    .map_err(|e| TlsError::acme("download certificate", e))?;
                break chain.ok_or_else(|| {
                    TlsError::acme("download certificate", "no certificate in response")
                })?;
            }
            OrderStatus::Invalid => {
                return Err(TlsError::acme("finalize", "order became invalid"));
            }
            _ => {
                if tokio::time::Instant::now() > deadline {
                    return Err(TlsError::acme("finalize", "timed out waiting for certificate"));
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    };

    let (leaf, issuer_certificate) = split_chain(&chain)?;
    let info = parse_certificate(&leaf)?;

    let cert_url = order.url().to_string();
    let cert_stable_url = order
        .state()
        .certificate
        .clone()
        .unwrap_or_else(|| cert_url.clone());

    info!(
        domains = ?info.domains,
        issued = %info.not_before,
        expires = %info.expires_at,
        "Certificate issued"
    );

    Ok(CertificateResource {
        domains: request.domains.clone(),
        cert_url,
        cert_stable_url,
        private_key: Some(cert_key.serialize_pem()),
        certificate: if request.bundle { chain } else { leaf },
        issuer_certificate,
    })
}
