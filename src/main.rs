//! autocert: ACME certificate issuance and renewal over DNS-01
//!
//! Keeps an ACME account key, obtains or renews a certificate for the
//! configured domains using Aliyun DNS for the DNS-01 challenge, and writes
//! the key, certificate and issuer chain next to a tracking record.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{
    ConfigLoader, KeyType, ReloadManager, Settings, DEFAULT_CONFIG_PATH, DEFAULT_DOTENV_PATH,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tls::{
    ca_display_name, resolve_acme_ca, AliyunDnsProvider, CertStorage, CertificateKeyType,
    CertificateLedger, Dns01Options, IdentityKeyManager, InstantAcmeClient,
    LifecycleOrchestrator, RunOutcome, RunRequest,
};
use tokio::sync::watch;
use tracing::{debug, error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Per-request timeout for the Aliyun DNS API
const ALIYUN_API_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "autocert")]
#[command(author, version, about = "ACME certificates over DNS-01 with Aliyun DNS")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (.yaml, .yml, .toml or .json)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Dotenv file with overrides
    #[arg(long, global = true, default_value = DEFAULT_DOTENV_PATH)]
    env_file: PathBuf,

    /// Log level
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain or renew the certificate once
    Run,
    /// Validate configuration
    Validate,
    /// Obtain or renew on a fixed interval until interrupted
    Daemon {
        /// Hours between runs
        #[arg(long, default_value_t = 24, value_parser = clap::value_parser!(u64).range(1..))]
        interval_hours: u64,
        /// Watch config file and pick up changes between runs
        #[arg(short, long)]
        watch: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    // Both ring and aws-lc may be compiled in, so pick one explicitly
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let loader = ConfigLoader::new(&cli.config).with_dotenv_path(&cli.env_file);

    let result = match cli.command {
        Some(Commands::Validate) => validate_config(&loader),
        Some(Commands::Daemon {
            interval_hours,
            watch,
        }) => block_on(run_daemon(
            loader,
            Duration::from_secs(interval_hours * 3600),
            watch,
        )),
        Some(Commands::Run) | None => block_on(run_single(loader)),
    };

    if let Err(e) = &result {
        error!(error = %format!("{:#}", e), "autocert failed");
    }
    result
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;
    rt.block_on(future)
}

fn load_settings(loader: &ConfigLoader) -> Result<Settings> {
    let settings = loader
        .load()
        .with_context(|| format!("Failed to load config from {:?}", loader.config_path()))?;
    info!(
        config = ?loader.config_path(),
        domains = ?settings.lego.domains,
        "Configuration loaded"
    );
    Ok(settings)
}

async fn run_single(loader: ConfigLoader) -> Result<()> {
    let settings = load_settings(&loader)?;
    let outcome = run_once(&settings, settings.lego.renew_before_days).await?;
    report_outcome(&outcome);
    Ok(())
}

fn certificate_key_type(key_type: KeyType) -> CertificateKeyType {
    match key_type {
        KeyType::Rsa2048 => CertificateKeyType::Rsa2048,
        KeyType::Ec256 => CertificateKeyType::Ec256,
    }
}

/// One lifecycle run against a settings snapshot
async fn run_once(settings: &Settings, renew_before_days: Option<i64>) -> Result<RunOutcome> {
    let lego = &settings.lego;

    let ca_url = resolve_acme_ca(&lego.ca_dir_url);
    info!(provider = %ca_display_name(&ca_url), url = %ca_url, "Using ACME CA");

    let dns_provider = AliyunDnsProvider::new(
        &settings.aliyun.access_key,
        &settings.aliyun.secret_key,
        lego.propagation_timeout(),
        ALIYUN_API_TIMEOUT,
    )
    .context("Failed to create Aliyun DNS provider")?;

    let keys = IdentityKeyManager::from_settings(
        lego.private_key_path.as_deref(),
        &ca_url,
        &lego.email,
    );

    let mut orchestrator = LifecycleOrchestrator::new(
        InstantAcmeClient::new(ca_url).with_key_type(certificate_key_type(lego.key_type)),
        keys,
        CertificateLedger::new(&lego.crt_save_dir),
        CertStorage::new(&lego.crt_save_dir),
        Arc::new(dns_provider),
    );

    let request = RunRequest {
        email: lego.email.clone(),
        domains: lego.domains.clone(),
        dns01: Dns01Options {
            nameservers: lego.resolver_addrs(),
            skip_propagation_check: lego.skip_propagation_check,
        },
        renew_before_days,
    };

    let outcome = orchestrator
        .run(&request)
        .await
        .context("Certificate run failed")?;
    Ok(outcome)
}

fn report_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Obtained { paths, ledger } => {
            info!(certificate = ?paths.certificate, record = ?ledger, "Certificate obtained");
        }
        RunOutcome::Renewed { paths, ledger } => {
            info!(certificate = ?paths.certificate, record = ?ledger, "Certificate renewed");
        }
        RunOutcome::UpToDate { expires_at } => {
            info!(expires_at = %expires_at, "Certificate still valid, nothing to do");
        }
    }
}

async fn run_daemon(loader: ConfigLoader, interval: Duration, watch_config: bool) -> Result<()> {
    let mut settings = Arc::new(load_settings(&loader)?);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping after the current run");
        let _ = shutdown_tx.send(true);
    })
    .context("Failed to install signal handler")?;

    // Reloads land in the channel and are only read between runs
    let mut snapshots = if watch_config {
        let manager = ReloadManager::new(loader, settings.clone())
            .context("Failed to start config watcher")?;
        let rx = manager.subscribe();
        manager.start();
        info!("Config file watcher enabled");
        Some(rx)
    } else {
        None
    };

    info!(
        interval_hours = interval.as_secs() / 3600,
        renew_before_days = settings.lego.daemon_renew_before_days(),
        "Starting renewal daemon"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if let Some(rx) = snapshots.as_mut() {
            if rx.has_changed().unwrap_or(false) {
                settings = rx.borrow_and_update().clone();
                info!(domains = ?settings.lego.domains, "Using reloaded configuration");
            }
        }

        // Without a window every tick would re-issue
        let renew_before_days = settings.lego.daemon_renew_before_days();
        match run_once(&settings, Some(renew_before_days)).await {
            Ok(outcome) => report_outcome(&outcome),
            Err(e) => {
                error!(error = %format!("{:#}", e), "Certificate run failed, retrying at next interval");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    info!("Daemon stopped");
    Ok(())
}

fn validate_config(loader: &ConfigLoader) -> Result<()> {
    let settings = load_settings(loader)?;
    let lego = &settings.lego;
    let ca_url = resolve_acme_ca(&lego.ca_dir_url);
    let keys =
        IdentityKeyManager::from_settings(lego.private_key_path.as_deref(), &ca_url, &lego.email);

    println!("Configuration is valid!");
    println!("  Email: {}", lego.email);
    println!("  Domains: {}", lego.domains.join(", "));
    println!("  Account key: {}", keys.path().display());
    println!("  Output directory: {}", lego.crt_save_dir.display());
    println!("  CA: {} ({})", ca_display_name(&ca_url), ca_url);
    println!("  Key type: {}", lego.key_type);
    println!("  DNS resolvers: {}", lego.dns_resolvers.join(", "));
    if lego.skip_propagation_check {
        println!("  Propagation check: skipped");
    } else {
        println!("  Propagation timeout: {}s", lego.propagation_timeout_secs);
    }
    match lego.renew_before_days {
        Some(days) => println!("  Renew before: {} days", days),
        None => println!(
            "  Renew before: always for run, {} days for daemon",
            lego.daemon_renew_before_days()
        ),
    }
    println!("  Aliyun access key: {}", settings.aliyun.access_key);
    println!("  Aliyun secret key: <redacted>");

    Ok(())
}
