//! Orders: creation, authorization retrieval and finalization.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use zeroize::Zeroizing;

use crate::{
    api::{self, OrderStatus},
    cert::{self, CertificateResource},
    trans::Transport,
    Error, Options, Result,
};

mod auth;

pub(crate) use self::auth::{deactivate_authorizations, fetch_authorizations};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// An order created with the ACME provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OrderResource {
    /// Order URL, from the `Location` header of the newOrder response.
    pub(crate) url: String,

    /// Requested domains, the first being the certificate's common name.
    pub(crate) domains: Vec<String>,

    /// Order as last returned by the server.
    pub(crate) body: api::Order,
}

impl OrderResource {
    pub(crate) fn common_name(&self) -> &str {
        self.domains.first().map_or("", String::as_str)
    }
}

/// Removes exact duplicates, keeping the first occurrence of each domain.
pub(crate) fn dedupe_domains(domains: &[impl AsRef<str>]) -> Vec<String> {
    let mut deduped = Vec::<String>::with_capacity(domains.len());
    for domain in domains {
        let domain = domain.as_ref();
        if !deduped.iter().any(|existing| existing == domain) {
            deduped.push(domain.to_owned());
        }
    }
    deduped
}

/// Creates an order for `domains` (already deduplicated).
pub(crate) async fn create_order(
    transport: &dyn Transport,
    new_order_url: &str,
    domains: &[String],
) -> Result<OrderResource> {
    if domains.is_empty() {
        return Err(Error::protocol("no domains to order a certificate for"));
    }

    let identifiers = domains.iter().map(api::Identifier::dns).collect();
    let payload = serde_json::to_value(api::Order::from_identifiers(identifiers))?;

    let res = transport.post(new_order_url, &payload).await?;

    let url = res
        .location()
        .ok_or_else(|| Error::protocol("newOrder response has no Location header"))?
        .to_owned();
    let body = res.json::<api::Order>()?;

    log::debug!("[{}] Order created: {url}", domains.join(", "));

    Ok(OrderResource {
        url,
        domains: domains.to_vec(),
        body,
    })
}

/// Submits the CSR and waits for the certificate to be issued.
pub(crate) async fn finalize(
    transport: &dyn Transport,
    options: &Options,
    order: &OrderResource,
    csr_der: &[u8],
    bundle: bool,
    private_key: Option<Zeroizing<String>>,
) -> Result<CertificateResource> {
    if order.body.finalize.is_empty() {
        return Err(Error::protocol("order has no finalize URL"));
    }

    let payload = serde_json::to_value(api::Finalize::from_der(csr_der))?;
    let res = transport.post(&order.body.finalize, &payload).await?;
    let finalized = res.json::<api::Order>()?;

    let api_order = match finalized.status {
        Some(OrderStatus::Valid) => finalized,
        Some(OrderStatus::Invalid) => return Err(order_invalid(&order.url, &finalized)),
        _ => poll_until_valid(transport, options, &order.url).await?,
    };

    let (certificate_url, certificate, issuer_certificate) =
        download(transport, order.common_name(), &api_order, bundle).await?;

    Ok(CertificateResource {
        domain: order.common_name().to_owned(),
        certificate_url,
        certificate,
        issuer_certificate,
        private_key,
        csr: None,
    })
}

/// Polls the order at `order_url` until it is valid, failing when it turns invalid or the
/// deadline passes.
async fn poll_until_valid(
    transport: &dyn Transport,
    options: &Options,
    order_url: &str,
) -> Result<api::Order> {
    let poll = async {
        let mut interval =
            tokio::time::interval(options.finalize_interval.max(MIN_POLL_INTERVAL));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            let api_order = transport.post_as_get(order_url).await?.json::<api::Order>()?;

            match api_order.status {
                Some(OrderStatus::Valid) => return Ok(api_order),
                Some(OrderStatus::Invalid) => return Err(order_invalid(order_url, &api_order)),
                status => log::trace!("Order {order_url} is {status:?}; polling again"),
            }
        }
    };

    tokio::time::timeout(options.finalize_timeout, poll)
        .await
        .map_err(|_| Error::Timeout(options.finalize_timeout))?
}

fn order_invalid(order_url: &str, api_order: &api::Order) -> Error {
    match &api_order.error {
        Some(problem) => Error::protocol(format!("order {order_url} is invalid: {problem}")),
        None => Error::protocol(format!("order {order_url} is invalid")),
    }
}

/// Downloads the certificate of a valid order, returning its URL, the certificate PEM and the
/// issuer PEM.
async fn download(
    transport: &dyn Transport,
    domain: &str,
    api_order: &api::Order,
    bundle: bool,
) -> Result<(String, Vec<u8>, Option<Vec<u8>>)> {
    let certificate_url = api_order
        .certificate
        .clone()
        .ok_or_else(|| Error::protocol("valid order has no certificate URL"))?;

    let res = transport.post_as_get(&certificate_url).await?;
    let up = res.links("up").into_iter().next();
    let mut certificate = res.into_body();

    log::info!("[{domain}] Server responded with a certificate.");

    let issuer = match up {
        Some(issuer_url) => match fetch_issuer(transport, &issuer_url).await {
            Ok(issuer) => {
                if bundle {
                    if !certificate.ends_with(b"\n") {
                        certificate.push(b'\n');
                    }
                    certificate.extend_from_slice(&issuer);
                }
                Some(issuer)
            }

            Err(err) => {
                log::warn!("[{domain}] acme: Could not bundle issuer certificate: {err}");
                None
            }
        },

        // without an up link the issuer can only come from a bundled response
        None => match cert::split_issuer(&certificate) {
            Ok(issuer) => issuer,
            Err(err) => {
                log::warn!("[{domain}] acme: Could not split issuer certificate: {err}");
                None
            }
        },
    };

    Ok((certificate_url, certificate, issuer))
}

async fn fetch_issuer(transport: &dyn Transport, issuer_url: &str) -> Result<Vec<u8>> {
    let res = transport.post_as_get(issuer_url).await?;
    cert::issuer_to_pem(res.body())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test::{self, MockCa, Reply};

    const ORDER_URL: &str = "https://ca.test/order/1";
    const FINALIZE_URL: &str = "https://ca.test/finalize/1";
    const CERT_URL: &str = "https://ca.test/cert/1";
    const ISSUER_URL: &str = "https://ca.test/issuer/1";

    fn order_body(status: &str) -> serde_json::Value {
        json!({
            "status": status,
            "identifiers": [{ "type": "dns", "value": "example.com" }],
            "authorizations": ["https://ca.test/authz/1"],
            "finalize": FINALIZE_URL,
            "certificate": CERT_URL
        })
    }

    fn order() -> OrderResource {
        OrderResource {
            url: ORDER_URL.to_owned(),
            domains: vec!["example.com".to_owned()],
            body: serde_json::from_value(order_body("ready")).unwrap(),
        }
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        assert_eq!(
            dedupe_domains(&["b.com", "a.com", "b.com", "A.com", "a.com"]),
            ["b.com", "a.com", "A.com"]
        );
    }

    #[tokio::test]
    async fn order_is_created_with_identifiers() {
        let ca = MockCa::new();
        ca.on(
            test::NEW_ORDER_URL,
            Reply::json(201, order_body("pending")).header("location", ORDER_URL),
        );

        let domains = dedupe_domains(&["example.com", "www.example.com", "example.com"]);
        let order = create_order(&*ca, test::NEW_ORDER_URL, &domains).await.unwrap();

        assert_eq!(order.url, ORDER_URL);
        assert_eq!(order.domains, ["example.com", "www.example.com"]);
        assert_eq!(order.common_name(), "example.com");

        let calls = ca.calls_to(test::NEW_ORDER_URL);
        assert_eq!(
            calls[0].payload,
            Some(json!({
                "identifiers": [
                    { "type": "dns", "value": "example.com" },
                    { "type": "dns", "value": "www.example.com" }
                ]
            }))
        );
    }

    #[tokio::test]
    async fn order_without_location_is_rejected() {
        let ca = MockCa::new();
        ca.on(test::NEW_ORDER_URL, Reply::json(201, order_body("pending")));

        let err = create_order(&*ca, test::NEW_ORDER_URL, &["example.com".to_owned()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let err = create_order(&*ca, test::NEW_ORDER_URL, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(ca.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn processing_order_is_polled_until_valid() {
        let leaf = test::leaf_certificate("example.com", &["example.com"]);

        let ca = MockCa::new();
        ca.on(FINALIZE_URL, Reply::json(200, order_body("processing")));
        for _ in 0..3 {
            ca.on(ORDER_URL, Reply::json(200, order_body("processing")));
        }
        ca.on(ORDER_URL, Reply::json(200, order_body("valid")));
        ca.on(CERT_URL, Reply::bytes(200, leaf.pem.as_bytes()));

        let start = tokio::time::Instant::now();
        let res = finalize(&*ca, &Options::default(), &order(), b"csr", false, None)
            .await
            .unwrap();

        assert!(start.elapsed() <= Duration::from_secs(2));
        assert_eq!(ca.calls_to(ORDER_URL).len(), 4);
        assert_eq!(res.domain, "example.com");
        assert_eq!(res.certificate_url, CERT_URL);
        assert_eq!(res.certificate, leaf.pem.as_bytes());
        assert_eq!(res.issuer_certificate, None);
    }

    #[tokio::test(start_paused = true)]
    async fn order_stuck_processing_times_out() {
        let ca = MockCa::new();
        ca.on(FINALIZE_URL, Reply::json(200, order_body("processing")));
        ca.on(ORDER_URL, Reply::json(200, order_body("processing")));

        let start = tokio::time::Instant::now();
        let err = finalize(&*ca, &Options::default(), &order(), b"csr", false, None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(timeout) if timeout == Duration::from_secs(30)));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(ca.calls_to(CERT_URL).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_order_status_keeps_polling() {
        let leaf = test::leaf_certificate("example.com", &["example.com"]);

        let ca = MockCa::new();
        ca.on(FINALIZE_URL, Reply::json(200, order_body("pending")));
        ca.on(ORDER_URL, Reply::json(200, order_body("deferred")));
        ca.on(ORDER_URL, Reply::json(200, order_body("valid")));
        ca.on(CERT_URL, Reply::bytes(200, leaf.pem.as_bytes()));

        finalize(&*ca, &Options::default(), &order(), b"csr", false, None)
            .await
            .unwrap();
        assert_eq!(ca.calls_to(ORDER_URL).len(), 2);
    }

    #[tokio::test]
    async fn invalid_order_is_terminal() {
        let mut invalid = order_body("invalid");
        invalid["error"] = json!({ "type": "urn:ietf:params:acme:error:badCSR", "detail": "bad" });

        let ca = MockCa::new();
        ca.on(FINALIZE_URL, Reply::json(200, invalid));

        let err = finalize(&*ca, &Options::default(), &order(), b"csr", false, None)
            .await
            .unwrap_err();
        let Error::Protocol(msg) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(msg.contains("badCSR"));
        assert!(ca.calls_to(ORDER_URL).is_empty());
    }

    #[tokio::test]
    async fn issuer_from_up_link_is_bundled() {
        let leaf = test::leaf_certificate("example.com", &["example.com"]);
        let ca_cert = test::ca_certificate();

        let ca = MockCa::new();
        ca.on(FINALIZE_URL, Reply::json(200, order_body("valid")));
        ca.on(
            CERT_URL,
            Reply::bytes(200, leaf.pem.as_bytes())
                .header("link", &format!("<{ISSUER_URL}>;rel=\"up\"")),
        );
        ca.on(ISSUER_URL, Reply::bytes(200, &ca_cert.der));

        let key = Zeroizing::new("KEY".to_owned());
        let res = finalize(&*ca, &Options::default(), &order(), b"csr", true, Some(key))
            .await
            .unwrap();

        let issuer = res.issuer_certificate.clone().unwrap();
        assert!(issuer.starts_with(b"-----BEGIN CERTIFICATE-----"));
        assert!(res.certificate.ends_with(&issuer));
        assert_eq!(res.certificate_chain().unwrap().len(), 2);
        assert_eq!(res.private_key.as_deref().map(String::as_str), Some("KEY"));
    }

    #[tokio::test]
    async fn unreachable_issuer_degrades_to_leaf() {
        let leaf = test::leaf_certificate("example.com", &["example.com"]);

        let ca = MockCa::new();
        ca.on(FINALIZE_URL, Reply::json(200, order_body("valid")));
        ca.on(
            CERT_URL,
            Reply::bytes(200, leaf.pem.as_bytes())
                .header("link", &format!("<{ISSUER_URL}>;rel=\"up\"")),
        );

        let res = finalize(&*ca, &Options::default(), &order(), b"csr", true, None)
            .await
            .unwrap();

        assert_eq!(res.certificate, leaf.pem.as_bytes());
        assert_eq!(res.issuer_certificate, None);
    }

    #[tokio::test]
    async fn issuer_is_split_from_bundled_response() {
        let leaf = test::leaf_certificate("example.com", &["example.com"]);
        let ca_cert = test::ca_certificate();
        let served = format!("{}{}", leaf.pem, ca_cert.pem);

        let ca = MockCa::new();
        ca.on(FINALIZE_URL, Reply::json(200, order_body("valid")));
        ca.on(CERT_URL, Reply::bytes(200, served.as_bytes()));

        let res = finalize(&*ca, &Options::default(), &order(), b"csr", false, None)
            .await
            .unwrap();

        assert_eq!(res.certificate, served.as_bytes());
        let issuer = res.issuer_certificate.unwrap();
        assert!(issuer.starts_with(b"-----BEGIN CERTIFICATE-----"));
        let issuer = cert::parse_pem_bundle(&issuer).unwrap();
        assert_eq!(issuer.len(), 1);
        assert_eq!(der::Encode::to_der(&issuer[0]).unwrap(), ca_cert.der);
    }

    #[tokio::test]
    async fn unparseable_bundle_still_returns_certificate() {
        let served = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";

        let ca = MockCa::new();
        ca.on(FINALIZE_URL, Reply::json(200, order_body("valid")));
        ca.on(CERT_URL, Reply::bytes(200, served.as_bytes()));

        let res = finalize(&*ca, &Options::default(), &order(), b"csr", false, None)
            .await
            .unwrap();

        assert_eq!(res.certificate, served.as_bytes());
        assert_eq!(res.issuer_certificate, None);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_finalize_interval_still_polls() {
        let leaf = test::leaf_certificate("example.com", &["example.com"]);

        let ca = MockCa::new();
        ca.on(FINALIZE_URL, Reply::json(200, order_body("processing")));
        ca.on(ORDER_URL, Reply::json(200, order_body("processing")));
        ca.on(ORDER_URL, Reply::json(200, order_body("valid")));
        ca.on(CERT_URL, Reply::bytes(200, leaf.pem.as_bytes()));

        let options = Options::default().finalize_interval(Duration::ZERO);
        let res = finalize(&*ca, &options, &order(), b"csr", false, None)
            .await
            .unwrap();

        assert_eq!(ca.calls_to(ORDER_URL).len(), 2);
        assert_eq!(res.certificate, leaf.pem.as_bytes());
    }
}
