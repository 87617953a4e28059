//! Obtaining certificates from ACME (Automatic Certificate Management Environment) providers such
//! as [Let's Encrypt](https://letsencrypt.org/).
//!
//! It implements [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555), using ACME v2 to
//! issue, renew and revoke certificates. A [`Client`] drives a whole order: it creates the order,
//! fetches the authorizations, solves their challenges, submits the CSR and downloads the
//! certificate.
//!
//! # Usage
//!
//! 1. Build a [`Client`] for a [`DirectoryUrl`] and an [`AccountIdentity`].
//! 2. [`register()`](Client::register()) the account, or [`resolve_by_key()`] one registered
//!    earlier.
//! 3. Register a [`ChallengeProvider`] per challenge type you can publish proofs for.
//! 4. [`obtain_certificate()`](Client::obtain_certificate()) and store the
//!    [`CertificateResource`]. Later, hand it to [`renew_certificate()`] or
//!    [`revoke_certificate()`].
//!
//! ## Examples
//!
//! A complete usage example serving `http-01` proofs is provided in the source repository under
//! `demos/http-01.rs`.
//!
//! # Domain Ownership
//!
//! Most website TLS certificates tries to prove ownership/control over the domain they are issued
//! for. For ACME, this means proving you control either:
//!
//! - a server answering TLS or HTTP requests for that domain;
//! - the DNS server answering name lookups against the domain.
//!
//! The [`challenge`] module describes how proofs are published.
//!
//! ## Multiple Domains
//!
//! When creating a new order, it's possible to provide multiple alt-names that will also be part of
//! the certificate. The ACME API requires you to prove ownership of each such domain. No
//! certificate is issued unless every domain is proven; the [`ObtainError`] lists what failed.
//!
//! # Rate Limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being abused. It
//! might be tempting to lower the polling intervals in [`Options`], but balance this against the
//! real risk of having access cut off.
//!
//! ## Use Staging For Development!
//!
//! Especially take care to use the Let's Encrypt staging environment for development where the rate
//! limits are more relaxed. See [`DirectoryUrl::LetsEncryptStaging`].
//!
//! [`resolve_by_key()`]: Client::resolve_by_key()
//! [`renew_certificate()`]: Client::renew_certificate()
//! [`revoke_certificate()`]: Client::revoke_certificate()
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod acc;
mod cert;
mod client;
mod dir;
mod error;
mod jws;
mod options;
mod order;
mod renew;
mod req;
mod trans;

pub mod api;
pub mod challenge;

#[cfg(test)]
mod test;

pub use crate::{
    acc::{AccountIdentity, AccountKey, RegistrationResource, RevocationReason},
    cert::{create_p256_key, CertificateResource, KeyType},
    challenge::{ChallengeProvider, ChallengeType, Solver},
    client::Client,
    dir::{Directory, DirectoryUrl},
    error::{Error, ObtainError, Result},
    options::Options,
    trans::{JwsTransport, Response, Transport},
};
