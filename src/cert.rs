use std::io::{BufReader, Cursor};

use der::{
    asn1::Ia5String,
    oid::{AssociatedOid, ObjectIdentifier},
    Decode as _, Encode as _,
};
use eyre::eyre;
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use time::OffsetDateTime;
use x509_cert::{
    builder::{Builder as _, RequestBuilder as CsrBuilder},
    ext::{
        pkix::{name::GeneralName, BasicConstraints, SubjectAltName},
        AsExtension, Extension,
    },
    name::Name,
    request::CertReq,
};
use zeroize::Zeroizing;

use crate::{Error, Result};

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_EXTENSION_REQ: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

/// Key algorithm used for certificate keys generated by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyType {
    /// ECDSA over NIST P-256.
    #[default]
    EcdsaP256,
}

impl KeyType {
    pub fn generate(self) -> p256::ecdsa::SigningKey {
        match self {
            KeyType::EcdsaP256 => create_p256_key(),
        }
    }
}

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// The TLS Feature extension of [RFC 7633] requesting `status_request` (OCSP must-staple).
///
/// [RFC 7633]: https://datatracker.ietf.org/doc/html/rfc7633
struct TlsFeature(Vec<u16>);

impl TlsFeature {
    const STATUS_REQUEST: u16 = 5;

    fn must_staple() -> Self {
        TlsFeature(vec![Self::STATUS_REQUEST])
    }
}

impl AssociatedOid for TlsFeature {
    const OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.1.24");
}

impl der::Encode for TlsFeature {
    fn encoded_len(&self) -> der::Result<der::Length> {
        self.0.encoded_len()
    }

    fn encode(&self, encoder: &mut impl der::Writer) -> der::Result<()> {
        self.0.encode(encoder)
    }
}

impl AsExtension for TlsFeature {
    fn critical(&self, _subject: &Name, _extensions: &[Extension]) -> bool {
        false
    }
}

/// Creates a DER CSR for `domains`, signed with `signer`.
///
/// The first item of `domains` is picked for the CSR's Common Name (CN). All domains are added to a
/// Subject Alternative Name (SAN) extension.
pub(crate) fn create_csr(
    signer: &p256::ecdsa::SigningKey,
    domains: &[String],
    must_staple: bool,
) -> Result<Vec<u8>> {
    let primary_domain = domains
        .first()
        .ok_or_else(|| Error::protocol("no domains to put in the CSR"))?;

    let subject = format!("CN={primary_domain}")
        .parse::<Name>()
        .map_err(|err| Error::Certificate(eyre!("invalid CSR subject {primary_domain}: {err}")))?;

    let mut csr = CsrBuilder::new(subject, signer)
        .map_err(|err| Error::Certificate(eyre!("could not start CSR: {err}")))?;

    let alt_names = domains
        .iter()
        .map(|domain| Ia5String::new(domain).map(GeneralName::DnsName))
        .collect::<der::Result<Vec<_>>>()
        .map_err(|err| Error::Certificate(eyre!("invalid domain name in CSR: {err}")))?;

    csr.add_extension(&SubjectAltName(alt_names))
        .map_err(|err| Error::Certificate(eyre!("could not add SAN extension: {err}")))?;

    if must_staple {
        csr.add_extension(&TlsFeature::must_staple())
            .map_err(|err| Error::Certificate(eyre!("could not add TLS feature: {err}")))?;
    }

    let csr = csr
        .build::<p256::ecdsa::DerSignature>()
        .map_err(|err| Error::Certificate(eyre!("could not build CSR: {err}")))?;

    csr.to_der().map_err(certificate_error)
}

/// Domains requested by a DER CSR: the Common Name first, then the SAN DNS names.
pub(crate) fn csr_domains(csr_der: &[u8]) -> Result<Vec<String>> {
    let csr = CertReq::from_der(csr_der).map_err(certificate_error)?;

    let mut alt_names = Vec::new();
    for attr in csr.info.attributes.iter() {
        if attr.oid != OID_EXTENSION_REQ {
            continue;
        }

        for value in attr.values.iter() {
            let der = value.to_der().map_err(certificate_error)?;
            let extensions = Vec::<Extension>::from_der(&der).map_err(certificate_error)?;
            alt_names.extend(dns_names(&extensions)?);
        }
    }

    Ok(merge_names(common_name(&csr.info.subject), alt_names))
}

pub(crate) fn csr_to_pem(csr_der: &[u8]) -> Result<Vec<u8>> {
    pem::encode_string("CERTIFICATE REQUEST", pem::LineEnding::LF, csr_der)
        .map(String::into_bytes)
        .map_err(certificate_error)
}

pub(crate) fn csr_from_pem(csr_pem: &[u8]) -> Result<Vec<u8>> {
    let (label, der) = pem::decode_vec(csr_pem).map_err(certificate_error)?;
    if label != "CERTIFICATE REQUEST" && label != "NEW CERTIFICATE REQUEST" {
        return Err(Error::Certificate(eyre!("expected a CSR, found PEM label {label}")));
    }
    Ok(der)
}

pub(crate) fn private_key_from_pem(pem: &str) -> Result<p256::ecdsa::SigningKey> {
    p256::ecdsa::SigningKey::from_pkcs8_pem(pem)
        .map_err(|err| Error::Certificate(eyre!("could not read certificate key PEM: {err}")))
}

pub(crate) fn private_key_to_pem(key: &p256::ecdsa::SigningKey) -> Result<Zeroizing<String>> {
    key.to_pkcs8_pem(pem::LineEnding::LF)
        .map_err(|err| Error::Certificate(eyre!("could not encode certificate key PEM: {err}")))
}

/// Decodes every certificate of a PEM bundle, leaf first.
pub(crate) fn parse_pem_bundle(bundle: &[u8]) -> Result<Vec<x509_cert::Certificate>> {
    let mut rdr = BufReader::new(Cursor::new(bundle));

    let certificates = rustls_pemfile::certs(&mut rdr)
        .map(|der| {
            let der = der.map_err(certificate_error)?;
            x509_cert::Certificate::from_der(&der).map_err(certificate_error)
        })
        .collect::<Result<Vec<_>>>()?;

    if certificates.is_empty() {
        return Err(Error::Certificate(eyre!("no certificates found in PEM bundle")));
    }

    Ok(certificates)
}

/// PEM-encodes an issuer certificate served as DER or PEM, checking it decodes.
pub(crate) fn issuer_to_pem(issuer: &[u8]) -> Result<Vec<u8>> {
    if issuer.trim_ascii_start().starts_with(b"-----BEGIN") {
        let chain = parse_pem_bundle(issuer)?;
        return encode_chain(&chain);
    }

    let cert = x509_cert::Certificate::from_der(issuer).map_err(certificate_error)?;
    encode_chain(std::slice::from_ref(&cert))
}

/// Certificates following the leaf in a PEM bundle, re-encoded as PEM.
pub(crate) fn split_issuer(bundle: &[u8]) -> Result<Option<Vec<u8>>> {
    let chain = parse_pem_bundle(bundle)?;
    match chain.get(1..) {
        Some(issuers) if !issuers.is_empty() => encode_chain(issuers).map(Some),
        _ => Ok(None),
    }
}

fn encode_chain(chain: &[x509_cert::Certificate]) -> Result<Vec<u8>> {
    let mut out = String::new();
    for cert in chain {
        let der = cert.to_der().map_err(certificate_error)?;
        let pem = pem::encode_string("CERTIFICATE", pem::LineEnding::LF, &der)
            .map_err(certificate_error)?;
        out.push_str(&pem);
    }
    Ok(out.into_bytes())
}

/// Returns true if the certificate's basic constraints mark it as a CA.
pub(crate) fn is_ca(cert: &x509_cert::Certificate) -> Result<bool> {
    for ext in cert.tbs_certificate.extensions.iter().flatten() {
        if ext.extn_id == BasicConstraints::OID {
            let constraints =
                BasicConstraints::from_der(ext.extn_value.as_bytes()).map_err(certificate_error)?;
            return Ok(constraints.ca);
        }
    }
    Ok(false)
}

/// Domains a certificate covers: the Common Name first, then the SAN DNS names.
pub(crate) fn certificate_domains(cert: &x509_cert::Certificate) -> Result<Vec<String>> {
    let extensions = cert.tbs_certificate.extensions.as_deref().unwrap_or_default();
    let alt_names = dns_names(extensions)?;
    Ok(merge_names(common_name(&cert.tbs_certificate.subject), alt_names))
}

pub(crate) fn not_after(cert: &x509_cert::Certificate) -> Result<OffsetDateTime> {
    let secs = cert
        .tbs_certificate
        .validity
        .not_after
        .to_unix_duration()
        .as_secs();
    let secs = i64::try_from(secs).map_err(certificate_error)?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(certificate_error)
}

fn common_name(name: &Name) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == OID_COMMON_NAME)
        .and_then(|atv| std::str::from_utf8(atv.value.value()).ok())
        .filter(|cn| !cn.is_empty())
        .map(ToOwned::to_owned)
}

fn dns_names(extensions: &[Extension]) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for ext in extensions {
        if ext.extn_id != SubjectAltName::OID {
            continue;
        }

        let san = SubjectAltName::from_der(ext.extn_value.as_bytes()).map_err(certificate_error)?;
        for name in san.0 {
            if let GeneralName::DnsName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }
    Ok(names)
}

/// Common name first, followed by each alt name not already listed.
fn merge_names(common_name: Option<String>, alt_names: Vec<String>) -> Vec<String> {
    let mut domains: Vec<String> = common_name.into_iter().collect();
    for name in alt_names {
        if !domains.contains(&name) {
            domains.push(name);
        }
    }
    domains
}

fn certificate_error(err: impl std::fmt::Display) -> Error {
    Error::Certificate(eyre!("{err}"))
}

/// An issued certificate as handed back to the caller.
///
/// This is the only durable output of the client. Store it to renew or revoke later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateResource {
    /// Common name of the certificate (first requested domain).
    pub domain: String,

    /// URL the certificate was downloaded from.
    pub certificate_url: String,

    /// Issued certificate in PEM format, followed by the issuer when bundled.
    pub certificate: Vec<u8>,

    /// Issuer certificate(s) in PEM format, if the server provided them.
    pub issuer_certificate: Option<Vec<u8>>,

    /// PKCS#8 PEM private key, when the key was generated or supplied for this request.
    pub private_key: Option<Zeroizing<String>>,

    /// PEM CSR the certificate was requested with, reused on renewal.
    pub csr: Option<Vec<u8>>,
}

impl CertificateResource {
    /// The certificate chain in DER format, leaf first.
    pub fn certificate_chain(&self) -> Result<Vec<Vec<u8>>> {
        parse_pem_bundle(&self.certificate)?
            .iter()
            .map(|cert| cert.to_der().map_err(certificate_error))
            .collect()
    }

    /// Inspect the leaf certificate to count the number of (whole) valid days left.
    ///
    /// It's up to the ACME API provider to decide how long an issued certificate is valid.
    /// Let's Encrypt sets the validity to 90 days, reported here as 89 since only _whole_ days
    /// count.
    ///
    /// It is possible to get negative days for an expired certificate.
    pub fn valid_days_left(&self) -> Result<i64> {
        let chain = parse_pem_bundle(&self.certificate)?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Certificate(eyre!("no certificates in chain")))?;

        Ok((not_after(leaf)? - OffsetDateTime::now_utc()).whole_days())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn csr_lists_common_name_first() {
        let key = create_p256_key();
        let domains = vec!["example.com".to_owned(), "www.example.com".to_owned()];

        let csr = create_csr(&key, &domains, false).unwrap();
        assert_eq!(csr_domains(&csr).unwrap(), domains);
    }

    #[test]
    fn must_staple_adds_tls_feature() {
        let key = create_p256_key();
        let domains = vec!["example.com".to_owned()];

        let csr = create_csr(&key, &domains, true).unwrap();
        let csr = CertReq::from_der(&csr).unwrap();

        let attr = csr.info.attributes.iter().next().unwrap();
        let der = attr.values.iter().next().unwrap().to_der().unwrap();
        let extensions = Vec::<Extension>::from_der(&der).unwrap();

        let feature = extensions
            .iter()
            .find(|ext| ext.extn_id == TlsFeature::OID)
            .unwrap();
        assert_eq!(feature.extn_value.as_bytes(), [0x30, 0x03, 0x02, 0x01, 0x05]);
    }

    #[test]
    fn csr_pem_round_trip() {
        let key = create_p256_key();
        let csr = create_csr(&key, &["example.com".to_owned()], false).unwrap();
        let pem = csr_to_pem(&csr).unwrap();
        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE REQUEST-----"));
        assert_eq!(csr_from_pem(&pem).unwrap(), csr);
    }

    #[test]
    fn certificate_domains_dedupe_common_name() {
        let leaf = test::leaf_certificate("example.com", &["example.com", "www.example.com"]);
        let chain = parse_pem_bundle(leaf.pem.as_bytes()).unwrap();

        assert_eq!(
            certificate_domains(&chain[0]).unwrap(),
            ["example.com", "www.example.com"]
        );
        assert!(!is_ca(&chain[0]).unwrap());
    }

    #[test]
    fn ca_certificate_is_detected() {
        let ca = test::ca_certificate();
        let chain = parse_pem_bundle(ca.pem.as_bytes()).unwrap();
        assert!(is_ca(&chain[0]).unwrap());
    }

    #[test]
    fn issuer_is_split_from_bundle() {
        let leaf = test::leaf_certificate("example.com", &["example.com"]);
        let ca = test::ca_certificate();
        let bundle = format!("{}{}", leaf.pem, ca.pem);

        let issuer = split_issuer(bundle.as_bytes()).unwrap().unwrap();
        let issuer = parse_pem_bundle(&issuer).unwrap();
        assert_eq!(issuer.len(), 1);
        assert_eq!(issuer[0].to_der().unwrap(), ca.der);

        assert!(split_issuer(leaf.pem.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn der_issuer_becomes_pem() {
        let ca = test::ca_certificate();
        let pem = issuer_to_pem(&ca.der).unwrap();
        assert!(pem.starts_with(b"-----BEGIN CERTIFICATE-----"));
        assert!(issuer_to_pem(b"garbage").is_err());
    }

    #[test]
    fn empty_bundle_is_rejected() {
        assert!(parse_pem_bundle(b"").is_err());
    }

    #[test]
    fn valid_days_left_of_fresh_certificate() {
        let leaf = test::leaf_certificate("example.com", &["example.com"]);
        let res = CertificateResource {
            domain: "example.com".to_owned(),
            certificate_url: String::new(),
            certificate: leaf.pem.into_bytes(),
            issuer_certificate: None,
            private_key: None,
            csr: None,
        };

        // rcgen certificates are valid until 4096-01-01
        assert!(res.valid_days_left().unwrap() > 365);
        assert_eq!(res.certificate_chain().unwrap(), [leaf.der]);
    }
}
