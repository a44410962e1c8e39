//! In-process ACME server answering instant-acme requests from a fixed script

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::prelude::*;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{Method, Request, Response, StatusCode};
use instant_acme::{BodyWrapper, BytesBody, BytesResponse, HttpClient};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::storage::test_support::issue_chain;

pub const BASE: &str = "https://ca.test";
pub const DIRECTORY_URL: &str = "https://ca.test/directory";
pub const ACCOUNT_URL: &str = "https://ca.test/acct/1";
pub const ORDER_URL: &str = "https://ca.test/order/1";
pub const CERT_URL: &str = "https://ca.test/cert/1";

/// One request as seen by the server, JWS payload decoded
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub payload: Option<Value>,
}

#[derive(Default)]
struct CaState {
    requests: Vec<Recorded>,
    domains: Vec<String>,
    chain: String,
    finalized: bool,
    fail_challenge: bool,
    nonce: u64,
}

#[derive(Clone)]
pub struct ScriptedCa {
    state: Arc<Mutex<CaState>>,
}

impl ScriptedCa {
    /// A CA that issues a chain for `domains`
    pub fn new(domains: &[&str]) -> Self {
        let (_, chain) = issue_chain(domains);
        Self {
            state: Arc::new(Mutex::new(CaState {
                chain,
                ..Default::default()
            })),
        }
    }

    /// Every challenge answers with an invalid status and an error
    pub fn failing_challenges(self) -> Self {
        self.state.lock().fail_challenge = true;
        self
    }

    pub fn chain(&self) -> String {
        self.state.lock().chain.clone()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().requests.clone()
    }

    /// Payloads POSTed to `path`, oldest first
    pub fn payloads_to(&self, path: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::POST && r.path == path)
            .filter_map(|r| r.payload)
            .collect()
    }

    pub fn http_client(&self) -> Box<dyn HttpClient> {
        Box::new(self.clone())
    }
}

impl HttpClient for ScriptedCa {
    fn request(
        &self,
        req: Request<BodyWrapper<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
        let state = self.state.clone();
        let (parts, body) = req.into_parts();
        // BodyWrapper only exposes its bytes once wrapped as a response body
        let mut body = BytesResponse::from(Response::new(body)).body;

        Box::pin(async move {
            let raw = body.into_bytes().await.map_err(instant_acme::Error::Other)?;
            let payload = decode_jws_payload(&raw);
            let path = parts.uri.path().to_string();

            let mut state = state.lock();
            state.requests.push(Recorded {
                method: parts.method.clone(),
                path: path.clone(),
                payload: payload.clone(),
            });
            Ok(state.answer(&parts.method, &path, payload))
        })
    }
}

impl CaState {
    fn answer(&mut self, method: &Method, path: &str, payload: Option<Value>) -> BytesResponse {
        match (method.as_str(), path) {
            ("GET", "/directory") => self.json(
                StatusCode::OK,
                None,
                json!({
                    "newNonce": format!("{}/nonce", BASE),
                    "newAccount": format!("{}/new-account", BASE),
                    "newOrder": format!("{}/new-order", BASE),
                }),
            ),
            ("HEAD", "/nonce") => self.respond(StatusCode::OK, None, Vec::new()),
            ("POST", "/new-account") => {
                self.json(StatusCode::CREATED, Some(ACCOUNT_URL), json!({"status": "valid"}))
            }
            ("POST", "/acct/1") => self.json(StatusCode::OK, None, json!({"status": "valid"})),
            ("POST", "/new-order") => {
                self.domains = payload
                    .as_ref()
                    .and_then(|p| p["identifiers"].as_array().cloned())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|id| id["value"].as_str().map(str::to_string))
                    .collect();
                let order = self.order("pending");
                self.json(StatusCode::CREATED, Some(ORDER_URL), order)
            }
            ("POST", "/order/1") => {
                let order = if self.finalized {
                    self.order("valid")
                } else {
                    self.order("ready")
                };
                self.json(StatusCode::OK, None, order)
            }
            ("POST", "/order/1/finalize") => {
                self.finalized = true;
                let order = self.order("processing");
                self.json(StatusCode::OK, None, order)
            }
            ("POST", "/cert/1") => {
                let chain = self.chain.clone().into_bytes();
                self.respond(StatusCode::OK, None, chain)
            }
            ("POST", p) if p.starts_with("/authz/") => {
                let index: usize = p["/authz/".len()..].parse().unwrap();
                let domain = self.domains[index - 1].clone();
                self.json(
                    StatusCode::OK,
                    None,
                    json!({
                        "identifier": {"type": "dns", "value": domain},
                        "status": "pending",
                        "challenges": [{
                            "type": "dns-01",
                            "url": format!("{}/chall/{}", BASE, index),
                            "token": format!("token-{}", index),
                            "status": "pending",
                        }],
                    }),
                )
            }
            ("POST", p) if p.starts_with("/chall/") => {
                let index = &p["/chall/".len()..];
                let mut challenge = json!({
                    "type": "dns-01",
                    "url": format!("{}{}", BASE, p),
                    "token": format!("token-{}", index),
                    "status": "processing",
                });
                if self.fail_challenge {
                    challenge["status"] = json!("invalid");
                    challenge["error"] = json!({
                        "type": "urn:ietf:params:acme:error:unauthorized",
                        "detail": "Incorrect TXT record",
                    });
                }
                self.json(StatusCode::OK, None, challenge)
            }
            _ => self.json(
                StatusCode::NOT_FOUND,
                None,
                json!({"type": "urn:ietf:params:acme:error:malformed", "detail": "not found"}),
            ),
        }
    }

    fn order(&self, status: &str) -> Value {
        let authorizations: Vec<String> = (1..=self.domains.len())
            .map(|i| format!("{}/authz/{}", BASE, i))
            .collect();
        let mut order = json!({
            "status": status,
            "identifiers": self
                .domains
                .iter()
                .map(|d| json!({"type": "dns", "value": d}))
                .collect::<Vec<_>>(),
            "authorizations": authorizations,
            "finalize": format!("{}/finalize", ORDER_URL),
        });
        if status == "valid" {
            order["certificate"] = json!(CERT_URL);
        }
        order
    }

    fn json(&mut self, status: StatusCode, location: Option<&str>, body: Value) -> BytesResponse {
        self.respond(status, location, serde_json::to_vec(&body).unwrap())
    }

    fn respond(&mut self, status: StatusCode, location: Option<&str>, body: Vec<u8>) -> BytesResponse {
        self.nonce += 1;
        let mut builder = Response::builder()
            .status(status)
            .header("Replay-Nonce", format!("nonce-{}", self.nonce))
            .header(CONTENT_TYPE, "application/json");
        if let Some(location) = location {
            builder = builder.header(LOCATION, location);
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        BytesResponse {
            parts,
            body: Box::new(Bytes::from(body)),
        }
    }
}

/// JWS payload as JSON. POST-as-GET and bodiless requests give None.
fn decode_jws_payload(raw: &[u8]) -> Option<Value> {
    let jws: Value = serde_json::from_slice(raw).ok()?;
    let payload = jws["payload"].as_str()?;
    if payload.is_empty() {
        return None;
    }
    let decoded = BASE64_URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&decoded).ok()
}
