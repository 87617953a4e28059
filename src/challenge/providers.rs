use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    api,
    challenge::{ChallengeProvider, CleanUp, PreSolver, SolveContext, Solver},
    Error, Result,
};

async fn present(
    provider: &dyn ChallengeProvider,
    ctx: &SolveContext<'_>,
    authz: &api::Authorization,
    challenge: &api::Challenge,
) -> Result<()> {
    let key_auth = ctx.key_authorization(&challenge.token)?;
    provider
        .present(authz.domain(), &challenge.token, &key_auth)
        .await
        .map_err(Error::Solver)
}

async fn clean_up(
    provider: &dyn ChallengeProvider,
    ctx: &SolveContext<'_>,
    authz: &api::Authorization,
    challenge: &api::Challenge,
) -> Result<()> {
    let key_auth = ctx.key_authorization(&challenge.token)?;
    provider
        .clean_up(authz.domain(), &challenge.token, &key_auth)
        .await
        .map_err(Error::Solver)
}

/// `http-01` solver: presents the proof and validates during solve.
pub struct Http01Solver {
    provider: Arc<dyn ChallengeProvider>,
}

impl Http01Solver {
    pub fn new(provider: Arc<dyn ChallengeProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Solver for Http01Solver {
    async fn solve(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()> {
        let domain = authz.domain();
        log::info!("[{domain}] acme: Trying to solve HTTP-01");

        present(&*self.provider, ctx, authz, challenge).await?;
        ctx.validate(domain, &challenge.url).await
    }

    fn cleanup(&self) -> Option<&dyn CleanUp> {
        Some(self)
    }
}

#[async_trait]
impl CleanUp for Http01Solver {
    async fn clean_up(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()> {
        clean_up(&*self.provider, ctx, authz, challenge).await
    }
}

/// `dns-01` solver: records are presented for all domains up front, then each is validated.
pub struct Dns01Solver {
    provider: Arc<dyn ChallengeProvider>,
}

impl Dns01Solver {
    pub fn new(provider: Arc<dyn ChallengeProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Solver for Dns01Solver {
    async fn solve(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()> {
        let domain = authz.domain();
        log::info!("[{domain}] acme: Trying to solve DNS-01");

        ctx.validate(domain, &challenge.url).await
    }

    fn pre_solver(&self) -> Option<&dyn PreSolver> {
        Some(self)
    }

    fn cleanup(&self) -> Option<&dyn CleanUp> {
        Some(self)
    }
}

#[async_trait]
impl PreSolver for Dns01Solver {
    async fn pre_solve(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()> {
        log::info!("[{}] acme: Preparing to solve DNS-01", authz.domain());
        present(&*self.provider, ctx, authz, challenge).await
    }
}

#[async_trait]
impl CleanUp for Dns01Solver {
    async fn clean_up(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()> {
        clean_up(&*self.provider, ctx, authz, challenge).await
    }
}

/// `tls-alpn-01` solver: presents the certificate and validates during solve.
pub struct TlsAlpn01Solver {
    provider: Arc<dyn ChallengeProvider>,
}

impl TlsAlpn01Solver {
    pub fn new(provider: Arc<dyn ChallengeProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Solver for TlsAlpn01Solver {
    async fn solve(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()> {
        let domain = authz.domain();
        log::info!("[{domain}] acme: Trying to solve TLS-ALPN-01");

        present(&*self.provider, ctx, authz, challenge).await?;
        ctx.validate(domain, &challenge.url).await
    }

    fn cleanup(&self) -> Option<&dyn CleanUp> {
        Some(self)
    }
}

#[async_trait]
impl CleanUp for TlsAlpn01Solver {
    async fn clean_up(
        &self,
        ctx: &SolveContext<'_>,
        authz: &api::Authorization,
        challenge: &api::Challenge,
    ) -> Result<()> {
        clean_up(&*self.provider, ctx, authz, challenge).await
    }
}
