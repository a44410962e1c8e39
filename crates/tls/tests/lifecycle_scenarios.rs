//! End-to-end lifecycle runs against a recording ACME client

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tempfile::TempDir;

use tls::dns::DnsResult;
use tls::storage::split_chain;
use tls::{
    AccountIdentity, AcmeClient, CertStorage, CertificateLedger, CertificateResource,
    Dns01Options, DnsProvider, IdentityKeyManager, LifecycleOrchestrator, ObtainRequest,
    Registration, RunOutcome, RunRequest, TlsError, TrackingRecord,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    ConfigureDns01,
    Register { agree_to_terms: bool },
    Resolve,
    Obtain { domains: Vec<String>, bundle: bool },
    Fetch { cert_url: String, exclude_private_key: bool },
    Renew { cert_url: String, bundle: bool },
}

type CallLog = Arc<Mutex<Vec<Call>>>;

struct FakeAcmeClient {
    calls: CallLog,
    serial: u32,
    fail_obtain: bool,
}

impl FakeAcmeClient {
    fn new(calls: CallLog) -> Self {
        Self {
            calls,
            serial: 0,
            fail_obtain: false,
        }
    }

    fn issue(&mut self, domains: &[String], bundle: bool) -> CertificateResource {
        self.serial += 1;
        let (key, chain) = issue_chain(domains);
        let (leaf, issuer) = split_chain(&chain).unwrap();
        CertificateResource {
            domains: domains.to_vec(),
            cert_url: format!("https://acme.test/order/{}", self.serial),
            cert_stable_url: format!("https://acme.test/cert/{}", self.serial),
            private_key: Some(key),
            certificate: if bundle { chain } else { leaf },
            issuer_certificate: issuer,
        }
    }
}

#[async_trait]
impl AcmeClient for FakeAcmeClient {
    fn configure_dns01(
        &mut self,
        _provider: Arc<dyn DnsProvider>,
        _options: Dns01Options,
    ) -> Result<(), TlsError> {
        self.calls.lock().push(Call::ConfigureDns01);
        Ok(())
    }

    async fn register_account(
        &mut self,
        _identity: &AccountIdentity,
        agree_to_terms: bool,
    ) -> Result<Registration, TlsError> {
        self.calls.lock().push(Call::Register { agree_to_terms });
        Ok(Registration {
            account_url: "https://acme.test/acct/1".to_string(),
        })
    }

    async fn resolve_account_by_key(
        &mut self,
        _identity: &AccountIdentity,
    ) -> Result<Registration, TlsError> {
        self.calls.lock().push(Call::Resolve);
        Ok(Registration {
            account_url: "https://acme.test/acct/1".to_string(),
        })
    }

    async fn obtain_certificate(
        &mut self,
        request: &ObtainRequest,
    ) -> Result<CertificateResource, TlsError> {
        self.calls.lock().push(Call::Obtain {
            domains: request.domains.clone(),
            bundle: request.bundle,
        });
        if self.fail_obtain {
            return Err(TlsError::Acme {
                operation: "order",
                message: "rejectedIdentifier".to_string(),
            });
        }
        Ok(self.issue(&request.domains, request.bundle))
    }

    async fn fetch_certificate(
        &mut self,
        cert_url: &str,
        exclude_private_key: bool,
    ) -> Result<CertificateResource, TlsError> {
        self.calls.lock().push(Call::Fetch {
            cert_url: cert_url.to_string(),
            exclude_private_key,
        });
        let mut resource = self.issue(&["example.com".to_string()], true);
        resource.cert_url = cert_url.to_string();
        resource.private_key = None;
        Ok(resource)
    }

    async fn renew_certificate(
        &mut self,
        resource: &CertificateResource,
        bundle: bool,
    ) -> Result<CertificateResource, TlsError> {
        self.calls.lock().push(Call::Renew {
            cert_url: resource.cert_url.clone(),
            bundle,
        });
        Ok(self.issue(&resource.domains, bundle))
    }
}

#[derive(Debug)]
struct NoopDns;

#[async_trait]
impl DnsProvider for NoopDns {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn create_txt_record(&self, _: &str, _: &str, _: &str) -> DnsResult<String> {
        Ok("1".to_string())
    }

    async fn delete_txt_record(&self, _: &str, _: &str) -> DnsResult<()> {
        Ok(())
    }

    fn propagation_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }
}

fn issue_chain(domains: &[String]) -> (String, String) {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Fake Issuer");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let leaf_cert = CertificateParams::new(domains.to_vec())
        .unwrap()
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .unwrap();

    (
        leaf_key.serialize_pem(),
        format!("{}{}", leaf_cert.pem(), ca_cert.pem()),
    )
}

struct Fixture {
    _dir: TempDir,
    key_path: PathBuf,
    out_dir: PathBuf,
    calls: CallLog,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            key_path: dir.path().join("accounts/admin@example.com.key"),
            out_dir: dir.path().join("certs"),
            calls: Arc::new(Mutex::new(Vec::new())),
            _dir: dir,
        }
    }

    async fn with_existing_key(self) -> Self {
        IdentityKeyManager::new(&self.key_path)
            .resolve_or_create()
            .await
            .unwrap();
        self
    }

    fn with_record(self, content: &str) -> Self {
        std::fs::create_dir_all(&self.out_dir).unwrap();
        std::fs::write(self.out_dir.join("example.com.json"), content).unwrap();
        self
    }

    fn orchestrator(&self, client: FakeAcmeClient) -> LifecycleOrchestrator<FakeAcmeClient> {
        LifecycleOrchestrator::new(
            client,
            IdentityKeyManager::new(&self.key_path),
            CertificateLedger::new(&self.out_dir),
            CertStorage::new(&self.out_dir),
            Arc::new(NoopDns),
        )
    }

    fn client(&self) -> FakeAcmeClient {
        FakeAcmeClient::new(self.calls.clone())
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self) -> TrackingRecord {
        let content = std::fs::read(self.out_dir.join("example.com.json")).unwrap();
        serde_json::from_slice(&content).unwrap()
    }
}

fn request() -> RunRequest {
    RunRequest {
        email: "admin@example.com".to_string(),
        domains: vec!["example.com".to_string(), "www.example.com".to_string()],
        dns01: Dns01Options::default(),
        renew_before_days: None,
    }
}

fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

const TRACKED: &str =
    r#"{"cert_url":"https://acme.test/cert/1","cert_stable_url":"https://acme.test/cert/1/stable"}"#;

#[tokio::test]
async fn first_run_registers_and_obtains() {
    let fixture = Fixture::new();
    let mut orchestrator = fixture.orchestrator(fixture.client());

    let outcome = orchestrator.run(&request()).await.unwrap();

    assert!(matches!(outcome, RunOutcome::Obtained { .. }));
    assert!(fixture.key_path.exists());
    assert_eq!(
        fixture.calls(),
        vec![
            Call::ConfigureDns01,
            Call::Register {
                agree_to_terms: true
            },
            Call::Obtain {
                domains: request().domains,
                bundle: true
            },
        ]
    );
    assert_eq!(fixture.record().cert_url, "https://acme.test/order/1");
    assert_eq!(fixture.record().cert_stable_url, "https://acme.test/cert/1");
}

#[tokio::test]
async fn outputs_are_three_material_files_and_one_record() {
    let fixture = Fixture::new();
    let mut orchestrator = fixture.orchestrator(fixture.client());

    orchestrator.run(&request()).await.unwrap();

    assert_eq!(
        dir_entries(&fixture.out_dir),
        vec![
            "example.com.crt",
            "example.com.issuer.crt",
            "example.com.json",
            "example.com.key",
        ]
    );

    let key = std::fs::read_to_string(fixture.out_dir.join("example.com.key")).unwrap();
    let account_key = std::fs::read_to_string(&fixture.key_path).unwrap();
    assert_ne!(key, account_key);

    let crt = std::fs::read_to_string(fixture.out_dir.join("example.com.crt")).unwrap();
    assert_eq!(::pem::parse_many(&crt).unwrap().len(), 2);
    let issuer = std::fs::read_to_string(fixture.out_dir.join("example.com.issuer.crt")).unwrap();
    assert_eq!(::pem::parse_many(&issuer).unwrap().len(), 1);
}

#[tokio::test]
async fn tracked_certificate_is_fetched_and_renewed() {
    let fixture = Fixture::new().with_existing_key().await.with_record(TRACKED);
    let mut orchestrator = fixture.orchestrator(fixture.client());

    let outcome = orchestrator.run(&request()).await.unwrap();

    assert!(matches!(outcome, RunOutcome::Renewed { .. }));
    assert_eq!(
        fixture.calls(),
        vec![
            Call::ConfigureDns01,
            Call::Resolve,
            Call::Fetch {
                cert_url: "https://acme.test/cert/1".to_string(),
                exclude_private_key: true
            },
            Call::Renew {
                cert_url: "https://acme.test/cert/1".to_string(),
                bundle: true
            },
        ]
    );

    // The fetch issued serial 1, the renewal serial 2
    assert_eq!(
        fixture.record(),
        TrackingRecord {
            cert_url: "https://acme.test/order/2".to_string(),
            cert_stable_url: "https://acme.test/cert/2".to_string(),
        }
    );
    assert!(fixture.out_dir.join("example.com.key").exists());
}

#[tokio::test]
async fn known_key_without_record_obtains() {
    let fixture = Fixture::new().with_existing_key().await;
    let mut orchestrator = fixture.orchestrator(fixture.client());

    orchestrator.run(&request()).await.unwrap();

    assert_eq!(
        fixture.calls(),
        vec![
            Call::ConfigureDns01,
            Call::Resolve,
            Call::Obtain {
                domains: request().domains,
                bundle: true
            },
        ]
    );
}

#[tokio::test]
async fn new_key_ignores_orphaned_record() {
    let fixture = Fixture::new().with_record(TRACKED);
    let mut orchestrator = fixture.orchestrator(fixture.client());

    orchestrator.run(&request()).await.unwrap();

    let calls = fixture.calls();
    assert_eq!(
        calls[1],
        Call::Register {
            agree_to_terms: true
        }
    );
    assert!(matches!(calls[2], Call::Obtain { .. }));
    assert_eq!(calls.len(), 3);
    assert_eq!(fixture.record().cert_url, "https://acme.test/order/1");
}

#[tokio::test]
async fn malformed_record_fails_before_any_acme_call() {
    let fixture = Fixture::new()
        .with_existing_key()
        .await
        .with_record("{not json");
    let mut orchestrator = fixture.orchestrator(fixture.client());

    let err = orchestrator.run(&request()).await.unwrap_err();

    assert!(matches!(err, TlsError::LedgerParse { .. }));
    assert!(fixture.calls().is_empty());
    assert!(!fixture.out_dir.join("example.com.crt").exists());
}

#[tokio::test]
async fn failed_issuance_writes_nothing() {
    let fixture = Fixture::new();
    let mut client = fixture.client();
    client.fail_obtain = true;
    let mut orchestrator = fixture.orchestrator(client);

    let err = orchestrator.run(&request()).await.unwrap_err();

    assert!(matches!(err, TlsError::Acme { .. }));
    assert!(!fixture.out_dir.exists());
}

#[tokio::test]
async fn second_run_renews_what_the_first_obtained() {
    let fixture = Fixture::new();

    fixture
        .orchestrator(fixture.client())
        .run(&request())
        .await
        .unwrap();
    let first = fixture.record();

    let outcome = fixture
        .orchestrator(fixture.client())
        .run(&request())
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Renewed { .. }));
    let calls = fixture.calls();
    assert_eq!(calls[3..5], [Call::ConfigureDns01, Call::Resolve]);
    assert_eq!(
        calls[5],
        Call::Fetch {
            cert_url: first.cert_url,
            exclude_private_key: true
        }
    );
}

#[tokio::test]
async fn renewal_skipped_while_certificate_is_fresh() {
    let fixture = Fixture::new();
    fixture
        .orchestrator(fixture.client())
        .run(&request())
        .await
        .unwrap();
    let before = fixture.calls().len();

    let mut req = request();
    req.renew_before_days = Some(30);
    let outcome = fixture
        .orchestrator(fixture.client())
        .run(&req)
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::UpToDate { .. }));
    assert_eq!(fixture.calls().len(), before);
}

#[tokio::test]
async fn negative_renew_window_is_rejected_before_any_acme_call() {
    let fixture = Fixture::new();
    fixture
        .orchestrator(fixture.client())
        .run(&request())
        .await
        .unwrap();
    let before = fixture.calls().len();

    let mut req = request();
    req.renew_before_days = Some(-400);
    let result = fixture.orchestrator(fixture.client()).run(&req).await;

    assert!(matches!(result, Err(TlsError::CertificateError(_))));
    assert_eq!(fixture.calls().len(), before);
}
