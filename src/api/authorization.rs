use serde::{Deserialize, Serialize};

use crate::api;

/// The status of an [`api::Authorization`].
///
/// See [RFC 8555 §7.1.6].
///
/// [RFC 8555 §7.1.6]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// An ACME authorization object.
///
/// Represents a server's authorization for an account to represent an identifier.
///
/// See [RFC 8555 §7.1.4].
///
/// # Example JSON
///
/// ```json
/// {
///   "identifier": { "type": "dns", "value": "www.example.org" },
///   "status": "pending",
///   "expires": "2019-01-09T08:26:43Z",
///   "challenges": [
///     {
///       "type": "http-01",
///       "status": "pending",
///       "url": "https://example.com/acme/chall/prV_B7yEyA4",
///       "token": "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w"
///     },
///     {
///       "type": "dns-01",
///       "status": "pending",
///       "url": "https://example.com/acme/chall/Rg5dV14Gh1Q",
///       "token": "RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8"
///     }
///   ]
/// }
/// ```
///
/// [RFC 8555 §7.1.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    /// Authorization identifier.
    pub identifier: api::Identifier,

    /// Authorization status.
    pub status: AuthorizationStatus,

    /// The timestamp after which the server will consider this authorization invalid.
    ///
    /// Uses RFC 3339 format.
    pub expires: Option<String>,

    /// Challenges the client can fulfill in order to prove possession of the identifier, in the
    /// order the server listed them.
    ///
    /// For valid authorizations, the challenge that was validated. For invalid ones, the challenge
    /// that was attempted and failed.
    #[serde(default)]
    pub challenges: Vec<api::Challenge>,

    /// Present and true for authorizations of a wildcard domain name.
    pub wildcard: Option<bool>,
}

impl Authorization {
    /// Domain name this authorization is for.
    pub fn domain(&self) -> &str {
        &self.identifier.value
    }

    /// Returns true if the server already considers this identifier authorized.
    pub fn is_status_valid(&self) -> bool {
        self.status == AuthorizationStatus::Valid
    }

    /// Returns true if authorization was created for a wildcard domain.
    pub fn is_wildcard(&self) -> bool {
        self.wildcard.unwrap_or(false)
    }

    /// Returns the first challenge of type `kind`, if one is present.
    pub fn challenge(&self, kind: &str) -> Option<&api::Challenge> {
        self.challenges.iter().find(|c| c._type == kind)
    }
}
