//! Certificate lifecycle orchestration
//!
//! One run decides between registering and resolving the ACME account and
//! between obtaining a new certificate and renewing the tracked one, then
//! writes the results out. The decision is made once, up front, from two
//! facts: whether the account key had to be created, and whether a tracking
//! record exists for the first domain.
//!
//! | key created | tracking record | account  | certificate   |
//! |-------------|-----------------|----------|---------------|
//! | yes         | yes             | register | obtain        |
//! | yes         | no              | register | obtain        |
//! | no          | yes             | resolve  | fetch + renew |
//! | no          | no              | resolve  | obtain        |
//!
//! A record left behind by a previous account key cannot be renewed by a
//! new account, so it is ignored and overwritten after the obtain.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::account::{AccountIdentity, IdentityKeyManager};
use crate::client::{AcmeClient, Dns01Options, ObtainRequest};
use crate::dns::DnsProvider;
use crate::error::TlsError;
use crate::ledger::{CertificateLedger, TrackingRecord};
use crate::storage::{CertStorage, MaterialPaths};

/// Where a run starts from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// The account key was just created
    NoIdentity,
    /// Known account key, nothing tracked for the domain set
    IdentityOnly,
    /// Known account key and a tracked certificate
    IdentityAndCertificate(TrackingRecord),
}

impl LifecycleState {
    /// Derive the state from the two signals
    pub fn classify(is_new_key: bool, record: Option<TrackingRecord>) -> Self {
        match (is_new_key, record) {
            (true, Some(record)) => {
                warn!(
                    cert_url = %record.cert_url,
                    "Tracking record belongs to a previous account key, obtaining a new certificate"
                );
                LifecycleState::NoIdentity
            }
            (true, None) => LifecycleState::NoIdentity,
            (false, None) => LifecycleState::IdentityOnly,
            (false, Some(record)) => LifecycleState::IdentityAndCertificate(record),
        }
    }

    pub fn plan(&self) -> LifecyclePlan {
        match self {
            LifecycleState::NoIdentity => LifecyclePlan {
                account: AccountAction::Register,
                certificate: CertificateAction::Obtain,
            },
            LifecycleState::IdentityOnly => LifecyclePlan {
                account: AccountAction::Resolve,
                certificate: CertificateAction::Obtain,
            },
            LifecycleState::IdentityAndCertificate(record) => LifecyclePlan {
                account: AccountAction::Resolve,
                certificate: CertificateAction::Renew(record.clone()),
            },
        }
    }

    fn name(&self) -> &'static str {
        match self {
            LifecycleState::NoIdentity => "no-identity",
            LifecycleState::IdentityOnly => "identity-only",
            LifecycleState::IdentityAndCertificate(_) => "identity-and-certificate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountAction {
    Register,
    Resolve,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateAction {
    Obtain,
    Renew(TrackingRecord),
}

/// The account and certificate operations for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePlan {
    pub account: AccountAction,
    pub certificate: CertificateAction,
}

/// Per-run inputs
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub email: String,
    /// The first domain names every output and tracking file
    pub domains: Vec<String>,
    pub dns01: Dns01Options,
    /// Skip a renewal while the saved certificate has more days left
    pub renew_before_days: Option<i64>,
}

/// What a run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Obtained {
        paths: MaterialPaths,
        ledger: PathBuf,
    },
    Renewed {
        paths: MaterialPaths,
        ledger: PathBuf,
    },
    /// Nothing to do yet
    UpToDate { expires_at: DateTime<Utc> },
}

/// Runs the lifecycle against one ACME client
pub struct LifecycleOrchestrator<C: AcmeClient> {
    client: C,
    keys: IdentityKeyManager,
    ledger: CertificateLedger,
    storage: CertStorage,
    dns_provider: Arc<dyn DnsProvider>,
}

impl<C: AcmeClient> LifecycleOrchestrator<C> {
    pub fn new(
        client: C,
        keys: IdentityKeyManager,
        ledger: CertificateLedger,
        storage: CertStorage,
        dns_provider: Arc<dyn DnsProvider>,
    ) -> Self {
        Self {
            client,
            keys,
            ledger,
            storage,
            dns_provider,
        }
    }

    /// Run once. Any error aborts the run; the tracking record is only
    /// written after every material file, so a re-run starts over cleanly.
    pub async fn run(&mut self, request: &RunRequest) -> Result<RunOutcome, TlsError> {
        let first_domain = request
            .domains
            .first()
            .ok_or_else(|| TlsError::CertificateError("No domains configured".to_string()))?
            .clone();
        if let Some(days) = request.renew_before_days.filter(|d| *d < 0) {
            return Err(TlsError::CertificateError(format!(
                "Renewal window must not be negative, got {} days",
                days
            )));
        }

        let resolved = self.keys.resolve_or_create().await?;
        let record = self.ledger.load(&first_domain).await?;
        let state = LifecycleState::classify(resolved.is_new, record);
        let plan = state.plan();

        info!(
            domain = %first_domain,
            state = state.name(),
            account = ?plan.account,
            key_path = ?self.keys.path(),
            "Starting certificate run"
        );

        if let (CertificateAction::Renew(_), Some(days)) =
            (&plan.certificate, request.renew_before_days)
        {
            match self.storage.load_certificate_info(&first_domain).await {
                Ok(Some(info)) if !info.expires_within_days(days) => {
                    info!(
                        domain = %first_domain,
                        days_left = info.remaining_days(),
                        "Certificate not due for renewal"
                    );
                    return Ok(RunOutcome::UpToDate {
                        expires_at: info.expires_at,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(domain = %first_domain, error = %e, "Cannot read saved certificate, renewing");
                }
            }
        }

        self.client
            .configure_dns01(self.dns_provider.clone(), request.dns01.clone())?;

        let identity = AccountIdentity::new(request.email.clone(), resolved.key);
        let registration = match plan.account {
            AccountAction::Register => self.client.register_account(&identity, true).await?,
            AccountAction::Resolve => self.client.resolve_account_by_key(&identity).await?,
        };
        let identity = identity.with_registration(registration);

        let (issued, renewed) = match &plan.certificate {
            CertificateAction::Obtain => {
                let request = ObtainRequest {
                    domains: request.domains.clone(),
                    bundle: true,
                };
                (self.client.obtain_certificate(&request).await?, false)
            }
            CertificateAction::Renew(record) => {
                let resource = self.client.fetch_certificate(&record.cert_url, true).await?;
                if resource.domains != request.domains {
                    warn!(
                        tracked = ?resource.domains,
                        configured = ?request.domains,
                        "Tracked certificate covers different domains than configured"
                    );
                }
                (self.client.renew_certificate(&resource, true).await?, true)
            }
        };

        let record = issued.tracking_record();
        let material = issued.into_material()?;
        let paths = self.storage.write_material(&first_domain, &material).await?;
        self.ledger.save(&first_domain, &record).await?;
        let ledger = self.ledger.path(&first_domain);

        info!(
            domain = %first_domain,
            account = ?identity.registration().map(|r| r.account_url.as_str()),
            cert_url = %record.cert_url,
            renewed = renewed,
            "Certificate run complete"
        );

        Ok(if renewed {
            RunOutcome::Renewed { paths, ledger }
        } else {
            RunOutcome::Obtained { paths, ledger }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TrackingRecord {
        TrackingRecord {
            cert_url: "https://acme.test/cert/1".to_string(),
            cert_stable_url: "https://acme.test/cert/1/stable".to_string(),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            LifecycleState::classify(true, Some(record())),
            LifecycleState::NoIdentity
        );
        assert_eq!(LifecycleState::classify(true, None), LifecycleState::NoIdentity);
        assert_eq!(LifecycleState::classify(false, None), LifecycleState::IdentityOnly);
        assert_eq!(
            LifecycleState::classify(false, Some(record())),
            LifecycleState::IdentityAndCertificate(record())
        );
    }

    #[test]
    fn test_plan_table() {
        let cases = [
            (true, Some(record()), AccountAction::Register, CertificateAction::Obtain),
            (true, None, AccountAction::Register, CertificateAction::Obtain),
            (false, None, AccountAction::Resolve, CertificateAction::Obtain),
            (
                false,
                Some(record()),
                AccountAction::Resolve,
                CertificateAction::Renew(record()),
            ),
        ];

        for (is_new_key, tracked, account, certificate) in cases {
            let plan = LifecycleState::classify(is_new_key, tracked).plan();
            assert_eq!(plan.account, account);
            assert_eq!(plan.certificate, certificate);
        }
    }
}
