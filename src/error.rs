use std::{collections::BTreeMap, fmt, time::Duration};

use crate::api::Problem;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while talking to an ACME provider.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The HTTP request could not be delivered or its response could not be read.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("acme server responded {status}: {problem}")]
    Remote {
        status: u16,
        problem: Problem,

        /// `Location` header of the error response, if any.
        location: Option<String>,
    },

    /// A challenge was marked invalid by the server.
    #[error("challenge failed: {0}")]
    Validation(Problem),

    /// One or more domains of an order failed.
    #[error(transparent)]
    Obtain(ObtainError),

    /// The order was not issued before the polling deadline.
    #[error("certificate polling timed out after {0:?}")]
    Timeout(Duration),

    /// The server broke the protocol or sent something this library cannot use.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("could not decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Failure in key, CSR or certificate handling.
    #[error("certificate error: {0}")]
    Certificate(eyre::Report),

    /// A challenge solver or provider failed.
    #[error("solver error: {0}")]
    Solver(eyre::Report),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Returns true for a `409 Conflict` response.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Remote { status: 409, .. })
    }

    /// Returns the problem document if the server sent one.
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Error::Remote { problem, .. } | Error::Validation(problem) => Some(problem),
            _ => None,
        }
    }
}

impl From<ObtainError> for Error {
    fn from(err: ObtainError) -> Self {
        Error::Obtain(err)
    }
}

/// Per-domain failures of an order.
///
/// Always holds at least one entry: use [`ObtainError::from_failures()`], which returns `None` for
/// an empty map, to build one.
#[derive(Debug)]
pub struct ObtainError {
    failures: BTreeMap<String, Error>,
}

impl ObtainError {
    /// Wraps `failures`, or returns `None` when nothing failed.
    pub fn from_failures(failures: BTreeMap<String, Error>) -> Option<Self> {
        if failures.is_empty() {
            None
        } else {
            Some(Self { failures })
        }
    }

    /// Number of failed domains. Never zero.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Always false, provided for API symmetry with [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// The error recorded for `domain`, if it failed.
    pub fn get(&self, domain: &str) -> Option<&Error> {
        self.failures.get(domain)
    }

    /// Failed domains in lexical order.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.failures.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.failures.iter().map(|(domain, err)| (domain.as_str(), err))
    }

    pub fn into_inner(self) -> BTreeMap<String, Error> {
        self.failures
    }
}

impl fmt::Display for ObtainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("error(s) obtaining certificate:")?;
        for (domain, err) in &self.failures {
            write!(f, "\n[{domain}] {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ObtainError {}
