use std::{fmt, sync::Arc};

use der::Encode as _;
use parking_lot::RwLock;

use crate::{
    acc::{AccountIdentity, RegistrationResource, RevocationReason},
    api,
    cert::{self, CertificateResource, KeyType},
    challenge::{
        self, ChallengeProvider, ChallengeType, Dns01Solver, Http01Solver, SolveContext, Solver,
        SolverRegistry, TlsAlpn01Solver,
    },
    dir::{Directory, DirectoryUrl},
    order::{self, OrderResource},
    trans::{JwsTransport, Transport},
    Error, Options, Result,
};

/// Obtains, renews and revokes certificates for one account.
///
/// A request for several domains either yields a certificate covering all of them or fails with
/// an [`ObtainError`](crate::ObtainError) naming every domain that could not be authorized.
///
/// The client can be shared between tasks, but running several orders for the same account
/// concurrently is up to the caller.
pub struct Client {
    directory: Directory,
    transport: Arc<dyn Transport>,
    solvers: SolverRegistry,
    options: Options,
    key_type: KeyType,
    pub(crate) email: Option<String>,
    pub(crate) registration: RwLock<Option<RegistrationResource>>,
}

impl Client {
    /// Fetches the directory and sets up request signing with the identity's account key.
    pub async fn new(
        directory_url: DirectoryUrl<'_>,
        identity: AccountIdentity,
        key_type: KeyType,
    ) -> Result<Client> {
        Self::new_with_options(directory_url, identity, key_type, Options::default()).await
    }

    /// Same as [`new()`](Self::new()) with non-default tuning.
    pub async fn new_with_options(
        directory_url: DirectoryUrl<'_>,
        identity: AccountIdentity,
        key_type: KeyType,
        options: Options,
    ) -> Result<Client> {
        let http = crate::req::http_client(&options.user_agent)?;
        let directory =
            Directory::fetch_with(&http, directory_url.to_url(), options.max_body_size).await?;

        if directory.new_nonce().is_empty() {
            return Err(Error::protocol("directory has no newNonce URL"));
        }

        let transport = JwsTransport::with_http(
            http,
            directory.new_nonce(),
            identity.key.clone(),
            options.max_body_size,
        );

        Ok(Self::with_transport(directory, identity, key_type, Arc::new(transport)).with_options(options))
    }

    /// Uses a caller supplied transport.
    ///
    /// The transport signs with its own key; only the contact and registration of `identity` are
    /// used.
    pub fn with_transport(
        directory: Directory,
        identity: AccountIdentity,
        key_type: KeyType,
        transport: Arc<dyn Transport>,
    ) -> Client {
        if let Some(registration) = &identity.registration {
            transport.set_key_id(registration.uri.clone());
        }

        Client {
            directory,
            transport,
            solvers: SolverRegistry::default(),
            options: Options::default(),
            key_type,
            email: identity.email,
            registration: RwLock::new(identity.registration),
        }
    }

    /// Replaces the polling and pacing options.
    ///
    /// HTTP settings (user agent, body size) of an already built transport are unaffected.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Solves challenges of type `challenge` through `provider` with the built-in solver.
    pub fn register_provider(
        &mut self,
        challenge: ChallengeType,
        provider: Arc<dyn ChallengeProvider>,
    ) -> &mut Self {
        let solver: Arc<dyn Solver> = match challenge {
            ChallengeType::Http01 => Arc::new(Http01Solver::new(provider)),
            ChallengeType::Dns01 => Arc::new(Dns01Solver::new(provider)),
            ChallengeType::TlsAlpn01 => Arc::new(TlsAlpn01Solver::new(provider)),
        };

        self.solvers.register(challenge.as_str(), solver);
        self
    }

    /// Solves challenges whose type tag is `challenge_type` with a custom solver.
    pub fn register_solver(
        &mut self,
        challenge_type: impl Into<String>,
        solver: Arc<dyn Solver>,
    ) -> &mut Self {
        self.solvers.register(challenge_type, solver);
        self
    }

    /// Stops solving challenges of the given types.
    pub fn exclude_challenges<T: AsRef<str>>(
        &mut self,
        challenge_types: impl IntoIterator<Item = T>,
    ) -> &mut Self {
        for challenge_type in challenge_types {
            self.solvers.exclude(challenge_type.as_ref());
        }
        self
    }

    /// Terms of service URL the provider asks accounts to agree to.
    pub fn tos_url(&self) -> Option<&str> {
        self.directory.terms_of_service()
    }

    /// Whether [`register_with_external_binding()`] is needed to register.
    ///
    /// [`register_with_external_binding()`]: Self::register_with_external_binding()
    pub fn external_account_required(&self) -> bool {
        self.directory.external_account_required()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    /// Obtains one certificate covering all `domains`.
    ///
    /// The first domain becomes the common name; duplicates are dropped. A certificate key of the
    /// client's key type is generated unless `key` is given. With `bundle`, the issuer certificate
    /// is appended to the certificate.
    ///
    /// Only authorization failures are reported per domain, through [`Error::Obtain`]. Finalize,
    /// polling timeout and download errors are returned once for the whole order.
    pub async fn obtain_certificate(
        &self,
        domains: &[impl AsRef<str>],
        bundle: bool,
        key: Option<p256::ecdsa::SigningKey>,
        must_staple: bool,
    ) -> Result<CertificateResource> {
        let domains = order::dedupe_domains(domains);
        if domains.is_empty() {
            return Err(Error::protocol("no domains to obtain a certificate for"));
        }

        let names = domains.join(", ");
        log::info!("[{names}] acme: Obtaining bundled SAN certificate");

        let order = order::create_order(self.transport(), self.directory.new_order(), &domains).await?;
        self.authorize(&order).await?;

        log::info!("[{names}] acme: Validations succeeded; requesting certificates");

        let key = key.unwrap_or_else(|| self.key_type.generate());
        let csr = cert::create_csr(&key, &domains, must_staple)?;
        let private_key = cert::private_key_to_pem(&key)?;

        order::finalize(
            self.transport(),
            &self.options,
            &order,
            &csr,
            bundle,
            Some(private_key),
        )
        .await
    }

    /// Obtains a certificate for an existing DER encoded CSR.
    ///
    /// Domains are taken from the CSR's common name and SAN extension. The returned resource
    /// carries the CSR but no private key.
    pub async fn obtain_certificate_for_csr(
        &self,
        csr_der: &[u8],
        bundle: bool,
    ) -> Result<CertificateResource> {
        let domains = order::dedupe_domains(&cert::csr_domains(csr_der)?);
        if domains.is_empty() {
            return Err(Error::protocol("CSR names no domains"));
        }

        let names = domains.join(", ");
        log::info!("[{names}] acme: Obtaining SAN certificate given a CSR");

        let order = order::create_order(self.transport(), self.directory.new_order(), &domains).await?;
        self.authorize(&order).await?;

        log::info!("[{names}] acme: Validations succeeded; requesting certificates");

        let mut resource =
            order::finalize(self.transport(), &self.options, &order, csr_der, bundle, None).await?;
        resource.csr = Some(cert::csr_to_pem(csr_der)?);

        Ok(resource)
    }

    /// Revokes the leaf of a PEM certificate bundle.
    pub async fn revoke_certificate(&self, cert_pem: &[u8]) -> Result<()> {
        self.revoke_certificate_with_reason(cert_pem, RevocationReason::Unspecified)
            .await
    }

    pub async fn revoke_certificate_with_reason(
        &self,
        cert_pem: &[u8],
        reason: RevocationReason,
    ) -> Result<()> {
        let chain = cert::parse_pem_bundle(cert_pem)?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::protocol("no certificate to revoke"))?;

        if cert::is_ca(leaf)? {
            return Err(Error::protocol(
                "certificate bundle starts with a CA certificate",
            ));
        }

        let der = leaf
            .to_der()
            .map_err(|err| Error::Certificate(eyre::eyre!("{err}")))?;

        let payload = serde_json::to_value(api::Revocation::new(&der, reason.code()))?;
        self.transport
            .post(self.directory.revoke_cert(), &payload)
            .await?;

        log::info!("acme: Certificate revoked");

        Ok(())
    }

    /// Gets every authorization of `order` to the valid state, or fails with the domains that
    /// could not be authorized.
    async fn authorize(&self, order: &OrderResource) -> Result<()> {
        let (authzs, failures) = order::fetch_authorizations(
            Arc::clone(&self.transport),
            order,
            self.options.launch_interval(),
        )
        .await;

        if let Some(err) = failures {
            order::deactivate_authorizations(self.transport(), order).await;
            return Err(err.into());
        }

        let ctx = SolveContext::new(self.transport(), &self.options);
        if let Some(err) = challenge::solve_for_authorizations(&self.solvers, &ctx, &authzs).await {
            order::deactivate_authorizations(self.transport(), order).await;
            return Err(err.into());
        }

        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("directory", &self.directory)
            .field("options", &self.options)
            .field("key_type", &self.key_type)
            .field("solvers", &self.solvers.types())
            .finish_non_exhaustive()
    }
}
