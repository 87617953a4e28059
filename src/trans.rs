use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{self, HeaderMap};
use serde::de::DeserializeOwned;

use crate::{
    acc::AccountKey,
    jws::{self, Jwk, JwsProtectedHeader},
    req::{header_str, req_expect_header, req_handle_error, req_head, req_post},
    Error, Result,
};

/// Bad nonces are retried this many times before the error is surfaced.
const MAX_NONCE_RETRIES: usize = 5;

/// Number of spare nonces kept from previous responses.
const NONCE_POOL_SIZE: usize = 10;

/// Successful (2xx) response to a signed request.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the first value of header `name` if it is valid ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    pub fn location(&self) -> Option<&str> {
        self.header(header::LOCATION.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Targets of all `Link` headers with relation `rel`, see [RFC 8288].
    ///
    /// [RFC 8288]: https://datatracker.ietf.org/doc/html/rfc8288
    pub fn links(&self, rel: &str) -> Vec<String> {
        self.headers
            .get_all(header::LINK)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(|link| {
                let (target, params) = link.trim().strip_prefix('<')?.split_once('>')?;

                let has_rel = params.split(';').any(|param| {
                    let Some((name, value)) = param.split_once('=') else {
                        return false;
                    };
                    name.trim().eq_ignore_ascii_case("rel")
                        && value
                            .trim()
                            .trim_matches('"')
                            .split_ascii_whitespace()
                            .any(|r| r.eq_ignore_ascii_case(rel))
                });

                has_rel.then(|| target.to_owned())
            })
            .collect()
    }

    /// Delay requested by the `Retry-After` header, when given in whole seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header(header::RETRY_AFTER.as_str())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Delivery of signed requests to the ACME API.
///
/// The transport owns the account key and the account URL (key ID) requests are attributed to.
/// Until a key ID is set, requests carry the full public key instead, as required for newAccount.
///
/// Both request methods fail with [`Error::Remote`] on non-2xx responses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs a signed JSON `payload` to `url`.
    async fn post(&self, url: &str, payload: &serde_json::Value) -> Result<Response>;

    /// POSTs a signed empty payload to `url`, the authenticated equivalent of a GET.
    async fn post_as_get(&self, url: &str) -> Result<Response>;

    /// Account URL requests are currently signed for.
    fn key_id(&self) -> Option<String>;

    /// Attributes subsequent requests to the account at `kid`.
    fn set_key_id(&self, kid: String);

    /// Base64url JWK thumbprint of the account key, used in key authorizations.
    fn key_thumbprint(&self) -> Result<String>;

    /// Flattened JWS binding the account key to the external account `eab_kid`.
    fn external_account_binding(
        &self,
        url: &str,
        eab_kid: &str,
        hmac_key: &[u8],
    ) -> Result<serde_json::Value>;
}

/// [`Transport`] signing requests with an ES256 [`AccountKey`] and sending them with reqwest.
///
/// Setup is:
///
/// 1. `JwsTransport::new()` with the directory's newNonce URL.
/// 2. the first call against newAccount is signed with the JWK.
/// 3. `set_key_id()` with the returned `Location` header.
/// 4. all calls after that are signed with the key ID.
#[derive(Debug)]
pub struct JwsTransport {
    http: reqwest::Client,
    acme_key: AccountKey,
    key_id: RwLock<Option<String>>,
    nonce_pool: NoncePool,
    max_body_size: usize,
}

impl JwsTransport {
    pub fn new(new_nonce_url: &str, acme_key: AccountKey) -> Result<Self> {
        let options = crate::Options::default();
        let http = crate::req::http_client(&options.user_agent)?;
        Ok(Self::with_http(
            http,
            new_nonce_url,
            acme_key,
            options.max_body_size,
        ))
    }

    pub(crate) fn with_http(
        http: reqwest::Client,
        new_nonce_url: &str,
        acme_key: AccountKey,
        max_body_size: usize,
    ) -> Self {
        JwsTransport {
            nonce_pool: NoncePool::new(http.clone(), new_nonce_url, max_body_size),
            http,
            acme_key,
            key_id: RwLock::new(None),
            max_body_size,
        }
    }

    async fn do_call(&self, url: &str, payload: Option<&serde_json::Value>) -> Result<Response> {
        let mut attempt = 0;

        // The ACME API may at any point invalidate all nonces.
        loop {
            attempt += 1;

            let nonce = self.nonce_pool.get_nonce().await?;

            let protected = match self.key_id() {
                Some(kid) => JwsProtectedHeader::new_kid(&kid, url, nonce),
                None => JwsProtectedHeader::new_jwk(Jwk::try_from(&self.acme_key)?, url, nonce),
            };
            let body = serde_json::to_string(&jws::sign_es256(&protected, &self.acme_key, payload)?)?;

            log::debug!("Call endpoint: {url}");

            let res = req_post(&self.http, url, body).await?;

            // Regardless of the request being a success or not, there might be a nonce in the
            // response.
            self.nonce_pool.extract_nonce(res.headers());

            match req_handle_error(res, self.max_body_size).await {
                Err(Error::Remote { problem, .. })
                    if attempt <= MAX_NONCE_RETRIES
                        && (problem.is_bad_nonce() || problem.is_jws_verification_error()) =>
                {
                    log::debug!("Retrying on: {problem}");
                    continue;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl Transport for JwsTransport {
    async fn post(&self, url: &str, payload: &serde_json::Value) -> Result<Response> {
        self.do_call(url, Some(payload)).await
    }

    async fn post_as_get(&self, url: &str) -> Result<Response> {
        self.do_call(url, None).await
    }

    fn key_id(&self) -> Option<String> {
        self.key_id.read().clone()
    }

    fn set_key_id(&self, kid: String) {
        log::debug!("Key ID is: {kid}");
        *self.key_id.write() = Some(kid);
    }

    fn key_thumbprint(&self) -> Result<String> {
        jws::thumbprint(&self.acme_key)
    }

    fn external_account_binding(
        &self,
        url: &str,
        eab_kid: &str,
        hmac_key: &[u8],
    ) -> Result<serde_json::Value> {
        let jws = jws::sign_eab(url, eab_kid, hmac_key, &self.acme_key)?;
        Ok(serde_json::to_value(jws)?)
    }
}

/// Nonces handed out by the server, see [RFC 8555 §7.2].
///
/// [RFC 8555 §7.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.2
#[derive(Debug)]
pub(crate) struct NoncePool {
    http: reqwest::Client,
    nonce_url: String,
    max_body_size: usize,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    fn new(http: reqwest::Client, nonce_url: &str, max_body_size: usize) -> Self {
        NoncePool {
            http,
            nonce_url: nonce_url.to_owned(),
            max_body_size,
            pool: Mutex::new(VecDeque::new()),
        }
    }

    fn extract_nonce(&self, headers: &HeaderMap) {
        let Some(nonce) = header_str(headers, "replay-nonce") else {
            return;
        };

        if !is_valid_nonce(nonce) {
            log::debug!("Ignoring malformed replay-nonce: {nonce}");
            return;
        }

        log::trace!("Extracting new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce.to_owned());

        if pool.len() > NONCE_POOL_SIZE {
            pool.pop_front();
        }
    }

    async fn get_nonce(&self) -> Result<String> {
        let pooled = self.pool.lock().pop_front();
        if let Some(nonce) = pooled {
            log::trace!("Use previous nonce");
            return Ok(nonce);
        }

        log::debug!("Request new nonce");
        let res = req_head(&self.http, &self.nonce_url).await?;
        let res = req_handle_error(res, self.max_body_size).await?;

        let nonce = req_expect_header(res.headers(), "replay-nonce")?;
        if !is_valid_nonce(&nonce) {
            return Err(Error::protocol(format!("malformed replay-nonce: {nonce}")));
        }

        Ok(nonce)
    }
}

/// Nonces must be non-empty base64url, see [RFC 8555 §6.5.1].
///
/// [RFC 8555 §6.5.1]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.5.1
fn is_valid_nonce(nonce: &str) -> bool {
    !nonce.is_empty()
        && nonce
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
