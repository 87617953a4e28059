//! JSON API payloads.
//!
//! These mirror the RFC 8555 resources as exchanged on the wire. Provided to aid debugging and for
//! custom [`Transport`](crate::Transport) and [`Solver`](crate::Solver) implementations.

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

mod account;
mod authorization;
mod challenge;
mod directory;
mod finalize;
mod identifier;
mod order;
mod revocation;

pub use self::{
    account::{Account, AccountStatus},
    authorization::{Authorization, AuthorizationStatus},
    challenge::{Challenge, ChallengeStatus},
    directory::{Directory, DirectoryMeta},
    finalize::Finalize,
    identifier::Identifier,
    order::{Order, OrderStatus},
    revocation::Revocation,
};

/// Serializes to `{}`.
///
/// Sent to a challenge URL to tell the server the proof is in place.
pub struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// Problem document returned by an ACME server ([RFC 7807]).
///
/// [RFC 7807]: https://datatracker.ietf.org/doc/html/rfc7807
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type", default)]
    pub _type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    /// Returns true if problem type is `badNonce`, with or without the URN namespace.
    pub fn is_bad_nonce(&self) -> bool {
        self._type.ends_with("badNonce")
    }

    /// Returns true if problem details indicate that JWS verification failed.
    pub fn is_jws_verification_error(&self) -> bool {
        (self._type == "urn:ietf:params:acme:error:malformed"
            || self._type == "urn:acme:error:malformed")
            && self
                .detail
                .as_deref()
                .is_some_and(|detail| detail == "JWS verification error")
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type)?,
            None => write!(f, "{}", self._type)?,
        }

        for sub in self.subproblems.iter().flatten() {
            match (&sub.identifier, &sub.detail) {
                (Some(id), Some(detail)) => write!(f, "; [{}] {}: {detail}", id.value, sub._type)?,
                (None, Some(detail)) => write!(f, "; {}: {detail}", sub._type)?,
                _ => write!(f, "; {}", sub._type)?,
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type", default)]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<identifier::Identifier>,
}
