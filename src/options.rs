use std::time::Duration;

/// Tuning knobs of a [`Client`](crate::Client).
///
/// The defaults match what public ACME providers expect. Lowering the polling intervals makes the
/// client hit provider [rate limits] sooner.
///
/// [rate limits]: https://letsencrypt.org/docs/rate-limits
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Options {
    /// Authorization fetches launched per second.
    pub request_limit: u32,

    /// Delay between order polls while waiting for issuance.
    pub finalize_interval: Duration,

    /// Absolute deadline for an order to become valid after finalization.
    pub finalize_timeout: Duration,

    /// Delay between challenge polls when the server sends no `Retry-After`.
    pub default_retry_after: Duration,

    /// Responses larger than this are rejected.
    pub max_body_size: usize,

    pub user_agent: String,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_limit(mut self, request_limit: u32) -> Self {
        self.request_limit = request_limit.max(1);
        self
    }

    pub fn finalize_interval(mut self, interval: Duration) -> Self {
        self.finalize_interval = interval;
        self
    }

    pub fn finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout = timeout;
        self
    }

    pub fn default_retry_after(mut self, delay: Duration) -> Self {
        self.default_retry_after = delay;
        self
    }

    pub fn max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Spacing between two authorization fetch launches.
    pub(crate) fn launch_interval(&self) -> Duration {
        (Duration::from_secs(1) / self.request_limit.max(1)).max(Duration::from_nanos(1))
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            request_limit: 18,
            finalize_interval: Duration::from_millis(500),
            finalize_timeout: Duration::from_secs(30),
            default_retry_after: Duration::from_secs(5),
            max_body_size: 1024 * 1024,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}
