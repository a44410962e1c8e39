//! Settings structures and layered loading for autocert
//!
//! Values come from three sources. From lowest to highest precedence:
//! the structured config file, the dotenv file, the process environment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default location of the structured config file
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Default location of the dotenv file
pub const DEFAULT_DOTENV_PATH: &str = ".env";

/// Let's Encrypt production directory, used when no CA is configured
pub const DEFAULT_CA_DIR_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Renewal window used by the daemon when `renew_before_days` is unset
pub const DEFAULT_DAEMON_RENEW_BEFORE_DAYS: i64 = 30;

/// Environment variable bindings, as (variable, settings key)
pub const ENV_BINDINGS: &[(&str, &str)] = &[
    ("LEGO_EMAIL", "lego.email"),
    ("LEGO_DOMAINS", "lego.domains"),
    ("LEGO_PRIVATE_KEY_PATH", "lego.private_key_path"),
    ("LEGO_CRT_SAVE_DIR", "lego.crt_save_dir"),
    ("LEGO_CA_DIR_URL", "lego.ca_dir_url"),
    ("LEGO_KEY_TYPE", "lego.key_type"),
    ("LEGO_SKIP_PROPAGATION_CHECK", "lego.skip_propagation_check"),
    ("ALIYUN_ACCESS_KEY", "aliyun.access_key"),
    ("ALIYUN_SECRET_KEY", "aliyun.secret_key"),
];

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Failed to load dotenv file {path:?}: {message}")]
    Dotenv { path: PathBuf, message: String },

    #[error("Unsupported config file format: {0:?}")]
    UnsupportedFormat(PathBuf),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root settings structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// ACME account and certificate settings
    #[serde(default)]
    pub lego: LegoSettings,

    /// Aliyun DNS credentials
    #[serde(default)]
    pub aliyun: AliyunSettings,
}

/// ACME account and certificate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegoSettings {
    /// Account contact email
    #[serde(default)]
    pub email: String,

    /// Domains on the certificate. The first one names every output file.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Full path of the account key file. Derived from the email when unset.
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    /// Directory for the certificate, key, issuer and tracking files
    #[serde(default = "default_crt_save_dir")]
    pub crt_save_dir: PathBuf,

    /// ACME directory URL or CA alias
    #[serde(default = "default_ca_dir_url")]
    pub ca_dir_url: String,

    /// Recursive nameservers used to confirm challenge propagation
    #[serde(default = "default_dns_resolvers")]
    pub dns_resolvers: Vec<String>,

    /// Upper bound on the wait for a challenge record to propagate
    #[serde(default = "default_propagation_timeout_secs")]
    pub propagation_timeout_secs: u64,

    /// Do not wait for the challenge record to show up on the resolvers
    /// before asking the CA to validate
    #[serde(default)]
    pub skip_propagation_check: bool,

    /// Key algorithm for issued certificates
    #[serde(default)]
    pub key_type: KeyType,

    /// Skip renewal while the saved certificate has more days left than this
    #[serde(default)]
    pub renew_before_days: Option<i64>,
}

/// Certificate key algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Rsa2048,
    Ec256,
}

impl FromStr for KeyType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rsa2048" => Ok(KeyType::Rsa2048),
            "ec256" => Ok(KeyType::Ec256),
            other => Err(ConfigError::Validation(format!(
                "lego.key_type '{}' is not supported (rsa2048, ec256)",
                other
            ))),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Rsa2048 => f.write_str("rsa2048"),
            KeyType::Ec256 => f.write_str("ec256"),
        }
    }
}

fn default_crt_save_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_ca_dir_url() -> String {
    DEFAULT_CA_DIR_URL.to_string()
}

fn default_dns_resolvers() -> Vec<String> {
    vec!["223.5.5.5".to_string(), "223.6.6.6".to_string()]
}

fn default_propagation_timeout_secs() -> u64 {
    600
}

impl Default for LegoSettings {
    fn default() -> Self {
        Self {
            email: String::new(),
            domains: Vec::new(),
            private_key_path: None,
            crt_save_dir: default_crt_save_dir(),
            ca_dir_url: default_ca_dir_url(),
            dns_resolvers: default_dns_resolvers(),
            propagation_timeout_secs: default_propagation_timeout_secs(),
            skip_propagation_check: false,
            key_type: KeyType::default(),
            renew_before_days: None,
        }
    }
}

impl LegoSettings {
    /// The domain that names the output and tracking files
    pub fn first_domain(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }

    pub fn propagation_timeout(&self) -> Duration {
        Duration::from_secs(self.propagation_timeout_secs)
    }

    /// Renewal window for daemon runs, which always need one
    pub fn daemon_renew_before_days(&self) -> i64 {
        self.renew_before_days.unwrap_or(DEFAULT_DAEMON_RENEW_BEFORE_DAYS)
    }

    /// Parsed resolver addresses. Call after `validate`.
    pub fn resolver_addrs(&self) -> Vec<IpAddr> {
        self.dns_resolvers
            .iter()
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }
}

/// Aliyun DNS credentials
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AliyunSettings {
    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,
}

impl fmt::Debug for AliyunSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AliyunSettings")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl Settings {
    /// Parse a structured config file, choosing the format by extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let settings = match extension.as_deref() {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };

        Ok(settings)
    }

    /// Overlay values keyed by environment variable name
    pub fn apply_overrides(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        for (var, key) in ENV_BINDINGS {
            let Some(value) = vars.get(*var) else {
                continue;
            };
            debug!(variable = %var, key = %key, "Applying override");

            match *var {
                "LEGO_EMAIL" => self.lego.email = value.clone(),
                "LEGO_DOMAINS" => {
                    self.lego.domains = value
                        .split(',')
                        .map(|d| d.trim().to_string())
                        .filter(|d| !d.is_empty())
                        .collect();
                }
                "LEGO_PRIVATE_KEY_PATH" => {
                    self.lego.private_key_path = Some(PathBuf::from(value));
                }
                "LEGO_CRT_SAVE_DIR" => self.lego.crt_save_dir = PathBuf::from(value),
                "LEGO_CA_DIR_URL" => self.lego.ca_dir_url = value.clone(),
                "LEGO_KEY_TYPE" => self.lego.key_type = value.parse()?,
                "LEGO_SKIP_PROPAGATION_CHECK" => {
                    self.lego.skip_propagation_check = parse_flag(var, value)?;
                }
                "ALIYUN_ACCESS_KEY" => self.aliyun.access_key = value.clone(),
                "ALIYUN_SECRET_KEY" => self.aliyun.secret_key = value.clone(),
                _ => {}
            }
        }
        Ok(())
    }

    /// Fold empty optional values back to their unset form
    fn normalize(&mut self) {
        if self
            .lego
            .private_key_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.lego.private_key_path = None;
        }
        if self.lego.crt_save_dir.as_os_str().is_empty() {
            self.lego.crt_save_dir = default_crt_save_dir();
        }
        for domain in &mut self.lego.domains {
            *domain = domain.trim().to_string();
        }
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let email = self.lego.email.trim();
        if email.is_empty() {
            return Err(ConfigError::Validation(
                "lego.email is not configured".to_string(),
            ));
        }
        if !email.contains('@') {
            return Err(ConfigError::Validation(format!(
                "lego.email '{}' is not an email address",
                email
            )));
        }

        if self.lego.domains.is_empty() {
            return Err(ConfigError::Validation(
                "lego.domains must list at least one domain".to_string(),
            ));
        }
        if self.lego.domains.iter().any(|d| d.is_empty()) {
            return Err(ConfigError::Validation(
                "lego.domains contains an empty entry".to_string(),
            ));
        }

        for resolver in &self.lego.dns_resolvers {
            if resolver.trim().parse::<IpAddr>().is_err() {
                return Err(ConfigError::Validation(format!(
                    "lego.dns_resolvers entry '{}' is not an IP address",
                    resolver
                )));
            }
        }

        if let Some(days) = self.lego.renew_before_days {
            if days < 0 {
                return Err(ConfigError::Validation(format!(
                    "lego.renew_before_days must not be negative, got {}",
                    days
                )));
            }
        }

        if self.aliyun.access_key.is_empty() || self.aliyun.secret_key.is_empty() {
            return Err(ConfigError::Validation(
                "aliyun.access_key and aliyun.secret_key are required (ALIYUN_ACCESS_KEY / ALIYUN_SECRET_KEY)"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ConfigError::Validation(format!(
            "{} must be true or false, got '{}'",
            var, other
        ))),
    }
}

/// Where environment overrides are read from
#[derive(Debug, Clone)]
enum EnvSource {
    Process,
    Fixed(HashMap<String, String>),
}

/// Layered settings loader
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: PathBuf,
    dotenv_path: Option<PathBuf>,
    env: EnvSource,
}

impl ConfigLoader {
    /// Create a loader for the given config file with the default dotenv path
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            dotenv_path: Some(PathBuf::from(DEFAULT_DOTENV_PATH)),
            env: EnvSource::Process,
        }
    }

    pub fn with_dotenv_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.dotenv_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn without_dotenv(mut self) -> Self {
        self.dotenv_path = None;
        self
    }

    /// Read overrides from a fixed map instead of the process environment
    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.env = EnvSource::Fixed(vars);
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load, overlay and validate one settings snapshot
    pub fn load(&self) -> Result<Settings, ConfigError> {
        let mut settings = Settings::from_file(&self.config_path)?;

        let dotenv_vars = self.read_dotenv()?;
        settings.apply_overrides(&dotenv_vars)?;

        let env_vars = self.read_env();
        settings.apply_overrides(&env_vars)?;

        settings.normalize();
        settings.validate()?;
        Ok(settings)
    }

    /// Parse the dotenv file without touching the process environment.
    /// A missing file is only worth a warning.
    fn read_dotenv(&self) -> Result<HashMap<String, String>, ConfigError> {
        let Some(path) = &self.dotenv_path else {
            return Ok(HashMap::new());
        };

        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(e) if e.not_found() => {
                warn!(path = ?path, "No dotenv file found");
                return Ok(HashMap::new());
            }
            Err(e) => {
                return Err(ConfigError::Dotenv {
                    path: path.clone(),
                    message: e.to_string(),
                })
            }
        };

        let mut vars = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| ConfigError::Dotenv {
                path: path.clone(),
                message: e.to_string(),
            })?;
            vars.insert(key, value);
        }
        Ok(vars)
    }

    fn read_env(&self) -> HashMap<String, String> {
        match &self.env {
            EnvSource::Fixed(vars) => vars.clone(),
            EnvSource::Process => ENV_BINDINGS
                .iter()
                .filter_map(|(var, _)| std::env::var(var).ok().map(|v| (var.to_string(), v)))
                .collect(),
        }
    }
}
