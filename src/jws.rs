//! JSON Web Signature framing for ACME requests.
//!
//! See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use hmac::{Hmac, Mac as _};
use p256::ecdsa::{signature::Signer as _, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{acc::AccountKey, Error, Result};

/// JWS Protected Header as required by [RFC 8555 §6.2].
///
/// > For newAccount requests, and for revokeCert requests authenticated by a certificate key,
/// > there MUST be a "jwk" field.
/// >
/// > For all other requests, the request is signed using an existing account, and there MUST be a
/// > "kid" field. This field MUST contain the account URL received by POSTing to the newAccount
/// > resource.
///
/// The external account binding of [RFC 8555 §7.3.4] reuses this header with `alg` set to a MAC
/// algorithm and no nonce.
///
/// [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
/// [RFC 8555 §7.3.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.4
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtectedHeader {
    alg: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,

    url: String,

    /// Mutually exclusive with `kid` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    /// Mutually exclusive with `jwk` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce: Some(nonce),
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce: Some(nonce),
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }

    fn new_eab(eab_kid: &str, url: &str) -> Self {
        JwsProtectedHeader {
            alg: "HS256".to_owned(),
            url: url.to_owned(),
            kid: Some(eab_kid.to_owned()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

impl TryFrom<&AccountKey> for Jwk {
    type Error = Error;

    fn try_from(key: &AccountKey) -> Result<Self> {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(Error::Certificate(eyre::eyre!(
                "account public key is not an uncompressed point"
            )));
        };

        Ok(Jwk {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        })
    }
}

/// Required members of an EC JWK, see [RFC 7638 §3.2].
///
/// [RFC 7638 §3.2]: https://datatracker.ietf.org/doc/html/rfc7638#section-3.2
#[derive(Debug, Serialize, Deserialize, Clone)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) struct JwkThumb {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl From<&Jwk> for JwkThumb {
    fn from(jwk: &Jwk) -> Self {
        JwkThumb {
            crv: jwk.crv.clone(),
            kty: jwk.kty.clone(),
            x: jwk.x.clone(),
            y: jwk.y.clone(),
        }
    }
}

/// Base64url SHA-256 thumbprint of the account key.
pub(crate) fn thumbprint(key: &AccountKey) -> Result<String> {
    let jwk = Jwk::try_from(key)?;
    let json = serde_json::to_string(&JwkThumb::from(&jwk))?;
    Ok(BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(json)))
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Signs `payload` with the account key. `None` produces the empty payload of a POST-as-GET.
pub(crate) fn sign_es256(
    protected: &JwsProtectedHeader,
    key: &AccountKey,
    payload: Option<&serde_json::Value>,
) -> Result<FlattenedJsonJws> {
    let protected = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(protected)?);
    let payload = match payload {
        Some(payload) => BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(payload)?),
        None => String::new(),
    };

    let to_sign = format!("{protected}.{payload}");
    let signature: Signature = key
        .signing_key()
        .try_sign(to_sign.as_bytes())
        .map_err(|err| Error::Certificate(eyre::eyre!("could not sign request: {err}")))?;

    Ok(FlattenedJsonJws {
        protected,
        payload,
        signature: BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    })
}

/// Builds the external account binding: the account JWK MAC'd with the CA-issued HMAC key.
pub(crate) fn sign_eab(
    url: &str,
    eab_kid: &str,
    hmac_key: &[u8],
    key: &AccountKey,
) -> Result<FlattenedJsonJws> {
    let jwk = Jwk::try_from(key)?;

    let protected =
        BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(&JwsProtectedHeader::new_eab(
            eab_kid, url,
        ))?);
    let payload = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(&jwk)?);

    let mut mac = Hmac::<Sha256>::new_from_slice(hmac_key)
        .map_err(|err| Error::protocol(format!("invalid external account HMAC key: {err}")))?;
    mac.update(format!("{protected}.{payload}").as_bytes());
    let signature = BASE64_URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(FlattenedJsonJws {
        protected,
        payload,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::{signature::Verifier as _, VerifyingKey};

    use super::*;

    fn decode_json(part: &str) -> serde_json::Value {
        serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(part).unwrap()).unwrap()
    }

    #[test]
    fn kid_header_omits_jwk() {
        let header = JwsProtectedHeader::new_kid("https://ca/acct/1", "https://ca/order", "n".into());
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["kid"], "https://ca/acct/1");
        assert!(json.get("jwk").is_none());
        assert_eq!(json["nonce"], "n");
    }

    #[test]
    fn es256_signature_verifies() {
        let key = AccountKey::generate();
        let jwk = Jwk::try_from(&key).unwrap();
        let header = JwsProtectedHeader::new_jwk(jwk, "https://ca/new-acct", "nonce".into());
        let payload = serde_json::json!({ "termsOfServiceAgreed": true });

        let jws = sign_es256(&header, &key, Some(&payload)).unwrap();
        assert_eq!(decode_json(&jws.payload), payload);
        assert_eq!(decode_json(&jws.protected)["jwk"]["crv"], "P-256");

        let signature =
            Signature::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(&jws.signature).unwrap()).unwrap();
        let verifying_key = VerifyingKey::from(key.signing_key());
        verifying_key
            .verify(format!("{}.{}", jws.protected, jws.payload).as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn post_as_get_has_empty_payload() {
        let key = AccountKey::generate();
        let header = JwsProtectedHeader::new_kid("kid", "https://ca/authz/1", "nonce".into());
        let jws = sign_es256(&header, &key, None).unwrap();
        assert_eq!(jws.payload, "");
    }

    #[test]
    fn eab_is_hmac_over_account_jwk() {
        let key = AccountKey::generate();
        let hmac_key = b"0123456789abcdef0123456789abcdef";
        let jws = sign_eab("https://ca/new-acct", "eab-kid", hmac_key, &key).unwrap();

        let protected = decode_json(&jws.protected);
        assert_eq!(protected["alg"], "HS256");
        assert_eq!(protected["kid"], "eab-kid");
        assert!(protected.get("nonce").is_none());
        assert_eq!(decode_json(&jws.payload)["kty"], "EC");

        let mut mac = Hmac::<Sha256>::new_from_slice(hmac_key).unwrap();
        mac.update(format!("{}.{}", jws.protected, jws.payload).as_bytes());
        mac.verify_slice(&BASE64_URL_SAFE_NO_PAD.decode(&jws.signature).unwrap())
            .unwrap();
    }

    #[test]
    fn thumbprint_is_stable_for_key() {
        let key = AccountKey::generate();
        assert_eq!(thumbprint(&key).unwrap(), thumbprint(&key).unwrap());
        assert_eq!(thumbprint(&key).unwrap().len(), 43);
    }
}
