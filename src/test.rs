#![allow(clippy::trivial_regex)]

use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    future::ready,
    net::TcpListener,
    sync::{Arc, OnceLock},
    time::Duration,
};

use actix_http::{HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use actix_web::body::MessageBody;
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::{api, dir::Directory, trans, Error, Result};

pub(crate) const NEW_NONCE_URL: &str = "https://ca.test/new-nonce";
pub(crate) const NEW_ACCOUNT_URL: &str = "https://ca.test/new-acct";
pub(crate) const NEW_ORDER_URL: &str = "https://ca.test/new-order";
pub(crate) const REVOKE_CERT_URL: &str = "https://ca.test/revoke-cert";

/// Directory pointing at the [`MockCa`] endpoints.
pub(crate) fn mock_directory() -> Directory {
    Directory::from_api(api::Directory {
        new_nonce: NEW_NONCE_URL.to_owned(),
        new_account: NEW_ACCOUNT_URL.to_owned(),
        new_order: NEW_ORDER_URL.to_owned(),
        revoke_cert: REVOKE_CERT_URL.to_owned(),
        meta: Some(api::DirectoryMeta {
            terms_of_service: Some("https://ca.test/terms".to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    })
    .unwrap()
}

/// Scripted answer of the [`MockCa`].
///
/// Statuses of 400 and above are turned into [`Error::Remote`], the body being the problem.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Option<Duration>,
}

impl Reply {
    pub(crate) fn json(status: u16, body: serde_json::Value) -> Self {
        Self::bytes(status, &serde_json::to_vec(&body).unwrap())
    }

    pub(crate) fn bytes(status: u16, body: &[u8]) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_vec(),
            delay: None,
        }
    }

    pub(crate) fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub(crate) fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn into_result(self) -> Result<trans::Response> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }

        if self.status >= 400 {
            return Err(Error::Remote {
                status: self.status,
                problem: serde_json::from_slice(&self.body).unwrap_or_default(),
                location: headers
                    .get("location")
                    .map(|value| value.to_str().unwrap().to_owned()),
            });
        }

        Ok(trans::Response::new(self.status, headers, self.body))
    }
}

/// A request received by the [`MockCa`].
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub(crate) url: String,

    /// `None` for POST-as-GET.
    pub(crate) payload: Option<serde_json::Value>,

    pub(crate) at: tokio::time::Instant,
}

/// In-memory ACME server answering from per-URL reply queues.
///
/// Replies are handed out in the order they were added; the last one for a URL repeats forever.
/// URLs without replies answer 404.
#[derive(Debug, Default)]
pub(crate) struct MockCa {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
    key_id: Mutex<Option<String>>,
}

impl MockCa {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn on(&self, url: &str, reply: Reply) -> &Self {
        self.routes
            .lock()
            .entry(url.to_owned())
            .or_default()
            .push_back(reply);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn calls_to(&self, url: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.url == url)
            .cloned()
            .collect()
    }

    async fn answer(&self, url: &str, payload: Option<serde_json::Value>) -> Result<trans::Response> {
        self.calls.lock().push(Call {
            url: url.to_owned(),
            payload,
            at: tokio::time::Instant::now(),
        });

        let reply = {
            let mut routes = self.routes.lock();
            match routes.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        let reply = reply.unwrap_or_else(|| {
            Reply::json(
                404,
                serde_json::json!({
                    "type": "urn:ietf:params:acme:error:malformed",
                    "detail": format!("no reply scripted for {url}")
                }),
            )
        });

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        reply.into_result()
    }
}

#[async_trait]
impl trans::Transport for MockCa {
    async fn post(&self, url: &str, payload: &serde_json::Value) -> Result<trans::Response> {
        self.answer(url, Some(payload.clone())).await
    }

    async fn post_as_get(&self, url: &str) -> Result<trans::Response> {
        self.answer(url, None).await
    }

    fn key_id(&self) -> Option<String> {
        self.key_id.lock().clone()
    }

    fn set_key_id(&self, kid: String) {
        *self.key_id.lock() = Some(kid);
    }

    fn key_thumbprint(&self) -> Result<String> {
        Ok("thumbprint".to_owned())
    }

    fn external_account_binding(
        &self,
        url: &str,
        eab_kid: &str,
        hmac_key: &[u8],
    ) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "url": url, "kid": eab_kid, "keyLen": hmac_key.len() }))
    }
}

/// Certificate fixture in both encodings.
pub(crate) struct TestCert {
    pub(crate) pem: String,
    pub(crate) der: Vec<u8>,
}

/// Self-signed leaf for `sans`, with common name `cn` unless empty.
pub(crate) fn leaf_certificate(cn: &str, sans: &[&str]) -> TestCert {
    let sans = sans.iter().map(|san| san.to_string()).collect::<Vec<_>>();
    let mut params = rcgen::CertificateParams::new(sans).unwrap();

    params.distinguished_name = rcgen::DistinguishedName::new();
    if !cn.is_empty() {
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
    }

    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();

    TestCert {
        pem: cert.pem(),
        der: cert.der().to_vec(),
    }
}

pub(crate) fn ca_certificate() -> TestCert {
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "Test Issuing CA");

    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();

    TestCert {
        pem: cert.pem(),
        der: cert.der().to_vec(),
    }
}

static RE_URL: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| Regex::new("<URL>").unwrap())
}

pub struct TestServer {
    pub dir_url: String,
    pub url: String,
    handle: ServerHandle,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

fn get_directory(url: &str, new_account: &str) -> Response<impl MessageBody> {
    const BODY: &str = r#"{
    "keyChange": "<URL>/acme/key-change",
    "newAccount": "<URL><NEW_ACCOUNT>",
    "newNonce": "<URL>/acme/new-nonce",
    "newOrder": "<URL>/acme/new-order",
    "revokeCert": "<URL>/acme/revoke-cert",
    "meta": {
        "caaIdentities": [
        "testdir.org"
        ],
        "termsOfService": "https://example.com/acme/terms/2017-6-14"
    }
    }"#;

    Response::with_body(
        StatusCode::OK,
        re_url()
            .replace_all(BODY, url)
            .replace("<NEW_ACCOUNT>", new_account),
    )
}

fn head_new_nonce() -> Response<impl MessageBody> {
    Response::build(StatusCode::NO_CONTENT)
        .insert_header((
            "Replay-Nonce",
            "8_uBBV3N2DBRJczhoiB46ugJKUkUHxGzVe6xIMpjHFM",
        ))
        .finish()
}

const ACCOUNT_BODY: &str = r#"{
    "id": 7728515,
    "key": {
        "use": "sig",
        "kty": "EC",
        "crv": "P-256",
        "alg": "ES256",
        "x": "ttpobTRK2bw7ttGBESRO7Nb23mbIRfnRZwunL1W6wRI",
        "y": "h2Z00J37_2qRKH0-flrHEsH0xbit915Tyvd2v_CAOSk"
    },
    "contact": [
        "mailto:foo@bar.com"
    ],
    "initialIp": "90.171.37.12",
    "createdAt": "2018-12-31T17:15:40.399104457Z",
    "status": "valid"
    }"#;

fn post_new_acct(url: &str) -> Response<impl MessageBody> {
    let location = re_url()
        .replace_all("<URL>/acme/acct/7728515", url)
        .into_owned();

    Response::build(StatusCode::CREATED)
        .insert_header(("Location", location))
        .insert_header((
            "Replay-Nonce",
            "9_uBBV3N2DBRJczhoiB46ugJKUkUHxGzVe6xIMpjHFM",
        ))
        .body(ACCOUNT_BODY)
}

fn post_existing_acct(url: &str) -> Response<impl MessageBody> {
    const BODY: &str = r#"{
    "type": "urn:ietf:params:acme:error:conflict",
    "detail": "Account already exists",
    "status": 409
    }"#;

    let location = re_url()
        .replace_all("<URL>/acme/acct/7728515", url)
        .into_owned();

    Response::build(StatusCode::CONFLICT)
        .insert_header(("Location", location))
        .insert_header(("Content-Type", "application/problem+json"))
        .body(BODY)
}

fn post_acct(_url: &str) -> Response<impl MessageBody> {
    Response::build(StatusCode::OK).body(ACCOUNT_BODY)
}

fn route_request(req: Request, url: &str) -> Response<impl MessageBody> {
    match (req.method(), req.path()) {
        (&Method::GET, "/directory") => get_directory(url, "/acme/new-acct").map_into_boxed_body(),
        (&Method::GET, "/conflict/directory") => {
            get_directory(url, "/acme/existing-acct").map_into_boxed_body()
        }
        (&Method::HEAD, "/acme/new-nonce") => head_new_nonce().map_into_boxed_body(),
        (&Method::POST, "/acme/new-acct") => post_new_acct(url).map_into_boxed_body(),
        (&Method::POST, "/acme/existing-acct") => post_existing_acct(url).map_into_boxed_body(),
        (&Method::POST, "/acme/acct/7728515") => post_acct(url).map_into_boxed_body(),

        (_, _) => Response::build(StatusCode::NOT_FOUND)
            .finish()
            .map_into_boxed_body(),
    }
}

pub fn with_directory_server() -> TestServer {
    let lst = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = lst.local_addr().unwrap().port();

    let url = format!("http://127.0.0.1:{port}");
    let dir_url = format!("{url}/directory");

    let server = Server::build()
        .listen("acme", lst, {
            let url = url.clone();
            move || {
                let url = url.clone();

                HttpService::build()
                    .finish(move |req| ready(Ok::<_, Infallible>(route_request(req, &url))))
                    .tcp()
            }
        })
        .unwrap()
        .workers(1)
        .run();

    let handle = server.handle();

    tokio::spawn(server);

    TestServer {
        dir_url,
        url,
        handle,
    }
}

#[tokio::test]
pub async fn test_make_directory() {
    let server = with_directory_server();
    let res = reqwest::get(&server.dir_url).await.unwrap();
    assert!(res.status().is_success());
}

#[tokio::test]
async fn mock_ca_repeats_last_reply() {
    use crate::trans::Transport as _;

    let ca = MockCa::new();
    ca.on("https://ca.test/x", Reply::json(200, serde_json::json!({ "n": 1 })))
        .on("https://ca.test/x", Reply::json(200, serde_json::json!({ "n": 2 })));

    for expected in [1, 2, 2] {
        let res = ca.post_as_get("https://ca.test/x").await.unwrap();
        assert_eq!(res.json::<serde_json::Value>().unwrap()["n"], expected);
    }

    let err = ca.post_as_get("https://ca.test/y").await.unwrap_err();
    assert!(matches!(err, Error::Remote { status: 404, .. }));
}
