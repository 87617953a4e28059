use base64::prelude::*;

use crate::{api, Client, Error, Result};

mod acme_key;

pub use self::acme_key::AccountKey;

/// Who certificates are requested as.
///
/// The account key belongs to the caller. Persist it (see [`AccountKey::to_pem()`]) together with
/// the registration to keep using the same account.
#[derive(Debug, Clone)]
pub struct AccountIdentity {
    /// Contact address, sent as a `mailto:` URI on registration.
    pub email: Option<String>,

    pub key: AccountKey,

    /// Registration from an earlier session, if any.
    pub registration: Option<RegistrationResource>,
}

impl AccountIdentity {
    pub fn new(email: Option<String>, key: AccountKey) -> Self {
        Self {
            email,
            key,
            registration: None,
        }
    }

    pub fn with_registration(mut self, registration: RegistrationResource) -> Self {
        self.registration = Some(registration);
        self
    }
}

/// An account as registered with the ACME provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResource {
    /// Account URL, used as key ID of all signed requests.
    pub uri: String,

    pub body: api::Account,
}

/// Enumeration of reasons for revocation.
///
/// The reason codes are taken from [RFC 5280 §5.3.1].
///
/// [RFC 5280 §5.3.1]: https://tools.ietf.org/html/rfc5280#section-5.3.1
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RevocationReason {
    #[default]
    Unspecified = 0,
    KeyCompromise = 1,
    CACompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    // value 7 is not used
    RemoveFromCRL = 8,
    PrivilegeWithdrawn = 9,
    AACompromise = 10,
}

impl RevocationReason {
    /// Reason code as sent to the server.
    pub(crate) fn code(self) -> Option<u8> {
        match self {
            // > the reason code CRL entry extension SHOULD be absent instead of
            // > using the unspecified (0) reasonCode value
            RevocationReason::Unspecified => None,

            reason => Some(reason as u8),
        }
    }
}

/// Account management.
impl Client {
    /// Registers the account, agreeing to the terms of service if `tos_agreed`.
    ///
    /// An account that already exists for the key is adopted.
    pub async fn register(&self, tos_agreed: bool) -> Result<RegistrationResource> {
        let account = api::Account {
            contact: Some(self.contact()),
            terms_of_service_agreed: Some(tos_agreed),
            ..Default::default()
        };

        self.new_account(account).await
    }

    /// Registers the account, binding it to an account the provider already knows.
    ///
    /// `hmac_b64url` is the MAC key handed out by the provider, base64url encoded.
    pub async fn register_with_external_binding(
        &self,
        tos_agreed: bool,
        key_id: &str,
        hmac_b64url: &str,
    ) -> Result<RegistrationResource> {
        let hmac_key = BASE64_URL_SAFE_NO_PAD
            .decode(hmac_b64url.trim_end_matches('='))
            .map_err(|err| Error::protocol(format!("external account HMAC is not base64url: {err}")))?;

        let binding = self.transport().external_account_binding(
            self.directory().new_account(),
            key_id,
            &hmac_key,
        )?;

        let account = api::Account {
            contact: Some(self.contact()),
            terms_of_service_agreed: Some(tos_agreed),
            external_account_binding: Some(binding),
            ..Default::default()
        };

        self.new_account(account).await
    }

    /// Looks up the account registered for the account key.
    pub async fn resolve_by_key(&self) -> Result<RegistrationResource> {
        log::info!("acme: Trying to resolve account by key");

        let payload = serde_json::to_value(api::Account {
            only_return_existing: Some(true),
            ..Default::default()
        })?;

        let res = self
            .transport()
            .post(self.directory().new_account(), &payload)
            .await?;

        let uri = res
            .location()
            .ok_or_else(|| Error::protocol("account lookup response has no Location header"))?
            .to_owned();

        self.transport().set_key_id(uri.clone());

        let body = self.fetch_account(&uri).await?;
        Ok(self.store_registration(uri, body))
    }

    /// Fetches the current state of the registered account.
    pub async fn query(&self) -> Result<RegistrationResource> {
        let uri = self.registration_uri()?;

        log::info!("acme: Querying account for {uri}");

        let body = self.fetch_account(&uri).await?;
        Ok(self.store_registration(uri, body))
    }

    /// Deactivates the registered account. Deactivated accounts can not be used again.
    pub async fn deactivate(&self) -> Result<()> {
        let uri = self.registration_uri()?;

        log::info!("acme: Deactivating account for {uri}");

        let payload = serde_json::to_value(api::Account {
            status: Some(api::AccountStatus::Deactivated),
            ..Default::default()
        })?;

        let res = self.transport().post(&uri, &payload).await?;

        let body = if res.body().is_empty() {
            api::Account {
                status: Some(api::AccountStatus::Deactivated),
                ..Default::default()
            }
        } else {
            res.json::<api::Account>()?
        };

        self.store_registration(uri, body);
        Ok(())
    }

    /// Registration the client currently signs requests for.
    pub fn registration(&self) -> Option<RegistrationResource> {
        self.registration.read().clone()
    }

    async fn new_account(&self, account: api::Account) -> Result<RegistrationResource> {
        let payload = serde_json::to_value(&account)?;

        match self
            .transport()
            .post(self.directory().new_account(), &payload)
            .await
        {
            Ok(res) => {
                let uri = res
                    .location()
                    .ok_or_else(|| Error::protocol("newAccount response has no Location header"))?
                    .to_owned();
                let body = res.json::<api::Account>()?;

                log::info!("acme: Registered account {uri}");

                Ok(self.store_registration(uri, body))
            }

            Err(Error::Remote {
                status: 409,
                location,
                ..
            }) => {
                let uri = location
                    .or_else(|| self.transport().key_id())
                    .or_else(|| self.registration().map(|registration| registration.uri))
                    .ok_or_else(|| {
                        Error::protocol("account already exists but its URL is unknown")
                    })?;

                log::info!("acme: Account already exists: {uri}");

                Ok(self.store_registration(uri, account))
            }

            Err(err) => Err(err),
        }
    }

    async fn fetch_account(&self, uri: &str) -> Result<api::Account> {
        let payload = serde_json::to_value(api::EmptyObject)?;
        self.transport().post(uri, &payload).await?.json()
    }

    fn registration_uri(&self) -> Result<String> {
        self.registration
            .read()
            .as_ref()
            .map(|registration| registration.uri.clone())
            .ok_or_else(|| Error::protocol("no registered account; register or resolve it first"))
    }

    fn store_registration(&self, uri: String, body: api::Account) -> RegistrationResource {
        self.transport().set_key_id(uri.clone());

        let registration = RegistrationResource { uri, body };
        *self.registration.write() = Some(registration.clone());
        registration
    }

    fn contact(&self) -> Vec<String> {
        self.email
            .iter()
            .map(|email| format!("mailto:{email}"))
            .collect()
    }
}
