use base64::prelude::*;
use serde::{Deserialize, Serialize};

/// Certificate revocation request.
///
/// See [RFC 8555 §7.6].
///
/// [RFC 8555 §7.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.6
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revocation {
    /// The certificate to be revoked, in the base64url-encoded version of the DER format.
    pub certificate: String,

    /// One of the revocation reasonCodes defined in [RFC 5280 §5.3.1].
    ///
    /// [RFC 5280 §5.3.1]: https://datatracker.ietf.org/doc/html/rfc5280#section-5.3.1
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<u8>,
}

impl Revocation {
    pub fn new(certificate_der: &[u8], reason: Option<u8>) -> Self {
        Self {
            certificate: BASE64_URL_SAFE_NO_PAD.encode(certificate_der),
            reason,
        }
    }
}
