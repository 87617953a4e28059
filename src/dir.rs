use crate::{
    api,
    req::{req_get, req_handle_error},
    Error, Options, Result,
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory.
    ///
    /// Not appropriate for testing / development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory.
    ///
    /// Use for testing and development. Doesn't issue "valid" certificates. The root signing
    /// certificate is not supposed to be in any trust chains.
    LetsEncryptStaging,

    /// Provide an arbitrary director URL to connect to.
    Other(&'a str),
}

impl DirectoryUrl<'_> {
    pub(crate) fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

/// Endpoints of an ACME provider, fetched once per client.
#[derive(Debug, Clone)]
pub struct Directory {
    api_directory: api::Directory,
}

impl Directory {
    /// Fetches and validates the directory at `url`.
    pub async fn fetch(url: DirectoryUrl<'_>) -> Result<Directory> {
        let options = Options::default();
        let http = crate::req::http_client(&options.user_agent)?;
        Self::fetch_with(&http, url.to_url(), options.max_body_size).await
    }

    pub(crate) async fn fetch_with(
        http: &reqwest::Client,
        url: &str,
        max_body_size: usize,
    ) -> Result<Directory> {
        log::debug!("Fetch directory: {url}");

        let res = req_handle_error(req_get(http, url).await?, max_body_size).await?;
        let api_directory = res
            .json::<api::Directory>()
            .map_err(|err| Error::protocol(format!("unparseable directory at {url}: {err}")))?;

        Self::from_api(api_directory)
    }

    /// Wraps an already decoded directory, checking the endpoints orders depend on are present.
    pub fn from_api(api_directory: api::Directory) -> Result<Directory> {
        if api_directory.new_account.is_empty() {
            return Err(Error::protocol("directory has no newAccount URL"));
        }

        if api_directory.new_order.is_empty() {
            return Err(Error::protocol("directory has no newOrder URL"));
        }

        Ok(Directory { api_directory })
    }

    pub fn new_nonce(&self) -> &str {
        &self.api_directory.new_nonce
    }

    pub fn new_account(&self) -> &str {
        &self.api_directory.new_account
    }

    pub fn new_order(&self) -> &str {
        &self.api_directory.new_order
    }

    pub fn revoke_cert(&self) -> &str {
        &self.api_directory.revoke_cert
    }

    /// Terms of service URL, if the provider publishes one.
    pub fn terms_of_service(&self) -> Option<&str> {
        self.api_directory
            .meta
            .as_ref()
            .and_then(|meta| meta.terms_of_service.as_deref())
    }

    /// Whether registration requires binding to an account at the provider.
    pub fn external_account_required(&self) -> bool {
        self.api_directory
            .meta
            .as_ref()
            .is_some_and(api::DirectoryMeta::external_account_required)
    }

    /// Returns a reference to the directory's API object.
    ///
    /// Useful for debugging.
    pub fn api_directory(&self) -> &api::Directory {
        &self.api_directory
    }
}
