//! Aliyun DNS (Alidns) provider
//!
//! Talks to the Alidns RPC API: every call is a signed GET against
//! `https://alidns.aliyuncs.com/` with the action and its parameters in the
//! query string. API documentation:
//! <https://help.aliyun.com/document_detail/29745.html>

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use parking_lot::RwLock;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Client;
use ring::hmac;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, trace};

use super::provider::{
    normalize_domain, DnsProvider, DnsProviderError, DnsResult, CHALLENGE_TTL,
};

/// Alidns API endpoint
pub const ALIYUN_DNS_ENDPOINT: &str = "https://alidns.aliyuncs.com/";

const API_VERSION: &str = "2015-01-09";

/// Largest page DescribeDomains allows
const PAGE_SIZE: u32 = 100;

/// RFC 3986 unreserved characters stay as they are, everything else is escaped
const RPC_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Aliyun DNS provider
pub struct AliyunDnsProvider {
    client: Client,
    endpoint: String,
    access_key: String,
    secret_key: String,
    propagation_timeout: Duration,
    /// Cache of domain -> zone name
    zone_cache: Arc<RwLock<HashMap<String, String>>>,
}

impl AliyunDnsProvider {
    /// Create a provider from RAM user credentials
    pub fn new(
        access_key: &str,
        secret_key: &str,
        propagation_timeout: Duration,
        api_timeout: Duration,
    ) -> DnsResult<Self> {
        if access_key.is_empty() || secret_key.is_empty() {
            return Err(DnsProviderError::Configuration(
                "Aliyun access key and secret key are required".to_string(),
            ));
        }

        let client = Client::builder().timeout(api_timeout).build().map_err(|e| {
            DnsProviderError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            endpoint: ALIYUN_DNS_ENDPOINT.to_string(),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            propagation_timeout,
            zone_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Build the full signed query string for an action
    fn signed_query(&self, action: &str, params: &[(&str, String)]) -> String {
        let mut all: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        all.insert("Action".to_string(), action.to_string());
        all.insert("Format".to_string(), "JSON".to_string());
        all.insert("Version".to_string(), API_VERSION.to_string());
        all.insert("AccessKeyId".to_string(), self.access_key.clone());
        all.insert("SignatureMethod".to_string(), "HMAC-SHA1".to_string());
        all.insert("SignatureVersion".to_string(), "1.0".to_string());
        all.insert("SignatureNonce".to_string(), uuid::Uuid::new_v4().to_string());
        all.insert(
            "Timestamp".to_string(),
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );

        let canonical = canonical_query(&all);
        let signature = sign(&self.secret_key, &canonical);
        format!("{}&Signature={}", canonical, percent_encode(&signature))
    }

    /// Call an API action and decode the JSON response
    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        params: &[(&str, String)],
    ) -> DnsResult<T> {
        let url = format!("{}?{}", self.endpoint, self.signed_query(action, params));
        trace!(action = %action, "Calling Alidns API");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                DnsProviderError::Timeout { elapsed_secs: 30 }
            } else {
                DnsProviderError::ApiRequest(format!("{} request failed: {}", action, e))
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            DnsProviderError::ApiRequest(format!("Failed to read {} response: {}", action, e))
        })?;

        if !status.is_success() {
            return Err(api_error(action, status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            DnsProviderError::ApiRequest(format!("Failed to parse {} response: {}", action, e))
        })
    }

    /// Get the zone (registered domain) that holds records for `domain`
    async fn get_zone(&self, domain: &str) -> DnsResult<String> {
        let normalized = normalize_domain(domain);

        {
            let cache = self.zone_cache.read();
            if let Some(zone) = cache.get(normalized) {
                trace!(domain = %domain, zone = %zone, "Zone found in cache");
                return Ok(zone.clone());
            }
        }

        let zones = self.list_zones().await?;
        let zone = find_matching_zone(normalized, &zones)?.to_string();

        self.zone_cache
            .write()
            .insert(normalized.to_string(), zone.clone());

        debug!(domain = %domain, zone = %zone, "Found zone for domain");
        Ok(zone)
    }

    /// List every domain in the account
    async fn list_zones(&self) -> DnsResult<Vec<String>> {
        let mut zones = Vec::new();
        let mut page = 1u32;

        loop {
            let response: DescribeDomainsResponse = self
                .call(
                    "DescribeDomains",
                    &[
                        ("PageNumber", page.to_string()),
                        ("PageSize", PAGE_SIZE.to_string()),
                    ],
                )
                .await?;

            let count = response.domains.domain.len();
            zones.extend(response.domains.domain.into_iter().map(|d| d.domain_name));

            if count == 0 || zones.len() as u64 >= response.total_count {
                break;
            }
            page += 1;
        }

        Ok(zones)
    }
}

impl std::fmt::Debug for AliyunDnsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliyunDnsProvider")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("propagation_timeout", &self.propagation_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DnsProvider for AliyunDnsProvider {
    fn name(&self) -> &'static str {
        "aliyun"
    }

    async fn create_txt_record(
        &self,
        domain: &str,
        record_name: &str,
        record_value: &str,
    ) -> DnsResult<String> {
        let zone = self.get_zone(domain).await?;
        let fqdn = format!("{}.{}", record_name, normalize_domain(domain));
        let rr = record_name_for_zone(&fqdn, &zone);

        debug!(domain = %domain, zone = %zone, rr = %rr, "Creating TXT record");

        let response: RecordIdResponse = self
            .call(
                "AddDomainRecord",
                &[
                    ("DomainName", zone.clone()),
                    ("RR", rr.clone()),
                    ("Type", "TXT".to_string()),
                    ("Value", record_value.to_string()),
                    ("TTL", CHALLENGE_TTL.to_string()),
                ],
            )
            .await
            .map_err(|e| match e {
                DnsProviderError::ApiRequest(message) => DnsProviderError::RecordCreation {
                    record_name: fqdn.clone(),
                    message,
                },
                other => other,
            })?;

        debug!(record_id = %response.record_id, "TXT record created");
        Ok(response.record_id)
    }

    async fn delete_txt_record(&self, domain: &str, record_id: &str) -> DnsResult<()> {
        debug!(domain = %domain, record_id = %record_id, "Deleting TXT record");

        let result: DnsResult<RecordIdResponse> = self
            .call("DeleteDomainRecord", &[("RecordId", record_id.to_string())])
            .await;

        match result {
            Ok(_) => {
                debug!(record_id = %record_id, "TXT record deleted");
                Ok(())
            }
            Err(DnsProviderError::ApiRequest(message)) if is_missing_record(&message) => {
                debug!(record_id = %record_id, "TXT record already gone");
                Ok(())
            }
            Err(DnsProviderError::ApiRequest(message)) => Err(DnsProviderError::RecordDeletion {
                record_id: record_id.to_string(),
                message,
            }),
            Err(e) => Err(e),
        }
    }

    fn propagation_timeout(&self) -> Duration {
        self.propagation_timeout
    }
}

/// Percent-encode per the RPC signing rules (RFC 3986, uppercase hex)
pub(crate) fn percent_encode(s: &str) -> String {
    utf8_percent_encode(s, RPC_ENCODE_SET).to_string()
}

/// Sorted `key=value` pairs joined by `&`, both sides percent-encoded
pub(crate) fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// HMAC-SHA1 signature over `GET&%2F&<encoded canonical query>`
pub(crate) fn sign(secret_key: &str, canonical_query: &str) -> String {
    let string_to_sign = format!(
        "GET&{}&{}",
        percent_encode("/"),
        percent_encode(canonical_query)
    );
    let key = hmac::Key::new(
        hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        format!("{}&", secret_key).as_bytes(),
    );
    let tag = hmac::sign(&key, string_to_sign.as_bytes());
    BASE64_STANDARD.encode(tag.as_ref())
}

/// Find the longest zone that is the domain itself or one of its parents
fn find_matching_zone<'a>(domain: &str, zones: &'a [String]) -> DnsResult<&'a str> {
    if let Some(zone) = zones.iter().find(|z| z.as_str() == domain) {
        return Ok(zone);
    }

    let mut current = domain;
    while let Some(pos) = current.find('.') {
        current = &current[pos + 1..];
        if let Some(zone) = zones.iter().find(|z| z.as_str() == current) {
            return Ok(zone);
        }
    }

    Err(DnsProviderError::ZoneNotFound {
        domain: domain.to_string(),
    })
}

/// Record name relative to its zone, `@` for the apex
fn record_name_for_zone(fqdn: &str, zone: &str) -> String {
    if fqdn == zone {
        "@".to_string()
    } else if let Some(stripped) = fqdn.strip_suffix(&format!(".{}", zone)) {
        stripped.to_string()
    } else {
        fqdn.to_string()
    }
}

fn api_error(action: &str, status: reqwest::StatusCode, body: &str) -> DnsProviderError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => {
            let message = format!("{}: {} ({})", err.code, err.message, err.request_id);
            if err.code.starts_with("InvalidAccessKeyId")
                || err.code == "SignatureDoesNotMatch"
                || err.code.starts_with("Forbidden")
            {
                DnsProviderError::Authentication(message)
            } else {
                DnsProviderError::ApiRequest(message)
            }
        }
        Err(_) => DnsProviderError::ApiRequest(format!(
            "{} failed: HTTP {} - {}",
            action, status, body
        )),
    }
}

fn is_missing_record(message: &str) -> bool {
    message.starts_with("DomainRecordNotBelongToUser") || message.starts_with("DomainRecordNotExist")
}

// API response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDomainsResponse {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    domains: DomainList,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DomainList {
    #[serde(default)]
    domain: Vec<DomainEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DomainEntry {
    domain_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecordIdResponse {
    record_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorResponse {
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    request_id: String,
}
