//! Proving control over domains.
//!
//! Each authorization offers challenges of different types. A [`Solver`] is registered per
//! challenge type; the first challenge of an authorization (in server order) with a registered
//! solver is the one attempted.
//!
//! Most callers only implement [`ChallengeProvider`], which knows how to publish a proof (write a
//! file, create a TXT record, serve a certificate) and hand it to
//! [`Client::register_provider()`](crate::Client::register_provider()). Built-in solvers then drive
//! the ACME side of the exchange.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use base64::prelude::*;
use sha2::{Digest as _, Sha256};

use crate::{
    api::{self, ChallengeStatus},
    trans::Transport,
    Error, Options, Result,
};

mod coordinator;
mod providers;

pub(crate) use self::coordinator::{solve_for_authorizations, SolverRegistry};
pub use self::providers::{Dns01Solver, Http01Solver, TlsAlpn01Solver};

/// Challenge types with a built-in solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    /// Proof served over plain HTTP, see [RFC 8555 §8.3].
    ///
    /// [RFC 8555 §8.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.3
    Http01,

    /// Proof published as a DNS `TXT` record, see [RFC 8555 §8.4].
    ///
    /// [RFC 8555 §8.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.4
    Dns01,

    /// Proof served as a self-signed certificate during a TLS handshake, see [RFC 8737].
    ///
    /// [RFC 8737]: https://datatracker.ietf.org/doc/html/rfc8737
    TlsAlpn01,
}

impl ChallengeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
        }
    }
}

impl AsRef<str> for ChallengeType {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http-01" => Ok(ChallengeType::Http01),
            "dns-01" => Ok(ChallengeType::Dns01),
            "tls-alpn-01" => Ok(ChallengeType::TlsAlpn01),
            other => Err(Error::protocol(format!("unknown challenge type: {other}"))),
        }
    }
}

/// What solvers get to talk to the ACME provider with.
pub struct SolveContext<'a> {
    transport: &'a dyn Transport,
    options: &'a Options,
}

impl<'a> SolveContext<'a> {
    pub(crate) fn new(transport: &'a dyn Transport, options: &'a Options) -> Self {
        Self { transport, options }
    }

    /// Key authorization for `token`: the token joined to the account key thumbprint.
    ///
    /// See [RFC 8555 §8.1](https://datatracker.ietf.org/doc/html/rfc8555#section-8.1).
    pub fn key_authorization(&self, token: &str) -> Result<String> {
        Ok(format!("{token}.{}", self.transport.key_thumbprint()?))
    }

    /// Tells the server the proof for the challenge at `challenge_url` is in place and waits for
    /// the outcome.
    ///
    /// Polls honoring `Retry-After` until the challenge is valid or invalid. There is no overall
    /// deadline; the server decides when validation ends.
    pub async fn validate(&self, domain: &str, challenge_url: &str) -> Result<()> {
        let payload = serde_json::to_value(api::EmptyObject)?;
        let mut res = self.transport.post(challenge_url, &payload).await?;

        loop {
            let challenge = res.json::<api::Challenge>()?;

            match challenge.status {
                ChallengeStatus::Valid => {
                    log::info!("[{domain}] The server validated our request");
                    return Ok(());
                }

                ChallengeStatus::Pending | ChallengeStatus::Processing => {}

                ChallengeStatus::Invalid => {
                    return Err(Error::Validation(challenge.error.unwrap_or_default()));
                }

                ChallengeStatus::Unknown => {
                    return Err(Error::protocol(format!(
                        "the server returned an unexpected challenge status for {domain}"
                    )));
                }
            }

            let delay = res
                .retry_after()
                .unwrap_or(self.options.default_retry_after);
            log::debug!("[{domain}] Challenge not validated yet, waiting {delay:?}");
            tokio::time::sleep(delay).await;

            res = self.transport.post_as_get(challenge_url).await?;
        }
    }
}

/// Completes a challenge of one type.
///
/// `solve` publishes the proof (unless a pre-solve step already did) and then calls
/// [`SolveContext::validate()`]. Optional capabilities are advertised through [`pre_solver`] and
/// [`cleanup`].
///
/// [`pre_solver`]: Solver::pre_solver()
/// [`cleanup`]: Solver::cleanup()
#[async_trait]
pub trait Solver: Send + Sync {
    async fn solve(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()>;

    /// Step run for every authorization before any is solved.
    fn pre_solver(&self) -> Option<&dyn PreSolver> {
        None
    }

    /// Step run after all solving finished, successful or not.
    fn cleanup(&self) -> Option<&dyn CleanUp> {
        None
    }
}

/// Publishing step separated from validation, e.g. to let DNS records propagate.
#[async_trait]
pub trait PreSolver: Send + Sync {
    async fn pre_solve(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()>;
}

/// Removes whatever a solver published.
#[async_trait]
pub trait CleanUp: Send + Sync {
    async fn clean_up(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()>;
}

/// Publishes and removes challenge proofs.
///
/// `domain` is the authorization identifier (without any `*.` wildcard prefix), `token` the
/// challenge token and `key_auth` the key authorization. Use the helpers [`http01_path`],
/// [`dns01_record`] and [`tls_alpn01_digest`] to derive what needs publishing.
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> eyre::Result<()>;

    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> eyre::Result<()>;
}

/// Path the `http-01` proof must be served at.
///
/// The response body is the key authorization.
pub fn http01_path(token: &str) -> String {
    format!("/.well-known/acme-challenge/{token}")
}

/// Fully qualified name and value of the `dns-01` `TXT` record.
pub fn dns01_record(domain: &str, key_auth: &str) -> (String, String) {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);

    let fqdn = if domain.ends_with('.') {
        format!("_acme-challenge.{domain}")
    } else {
        format!("_acme-challenge.{domain}.")
    };

    (fqdn, BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth)))
}

/// SHA-256 of the key authorization, to be put in the `acmeIdentifier` extension of the
/// `tls-alpn-01` certificate.
pub fn tls_alpn01_digest(key_auth: &str) -> [u8; 32] {
    let mut digest = [0; 32];
    digest.copy_from_slice(&Sha256::digest(key_auth));
    digest
}
