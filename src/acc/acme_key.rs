use std::fmt;

use eyre::WrapErr as _;
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use zeroize::Zeroizing;

use crate::{Error, Result};

/// Private key identifying an account with the ACME provider.
///
/// Accounts use elliptic curve P-256 (`ES256` signatures). The key belongs to the caller: it is
/// never generated implicitly and should be persisted to reuse the account.
#[derive(Clone)]
pub struct AccountKey {
    signing_key: p256::ecdsa::SigningKey,
}

impl AccountKey {
    /// Generates a fresh P-256 account key.
    pub fn generate() -> AccountKey {
        Self::from_signing_key(crate::create_p256_key())
    }

    /// Reads a PKCS#8 PEM encoded P-256 private key.
    pub fn from_pem(pem: &str) -> Result<AccountKey> {
        let signing_key = p256::ecdsa::SigningKey::from_pkcs8_pem(pem)
            .wrap_err("failed to read account key PEM")
            .map_err(Error::Certificate)?;
        Ok(Self::from_signing_key(signing_key))
    }

    pub fn from_signing_key(signing_key: p256::ecdsa::SigningKey) -> AccountKey {
        AccountKey { signing_key }
    }

    /// PKCS#8 PEM encoding of the private key.
    pub fn to_pem(&self) -> Result<Zeroizing<String>> {
        self.signing_key
            .to_pkcs8_pem(pem::LineEnding::LF)
            .wrap_err("failed to encode account key PEM")
            .map_err(Error::Certificate)
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey").finish_non_exhaustive()
    }
}
