//! The `hearth-device` library crate turns an appliance into a `hearth`
//! device: it joins the cloud service, accepts authenticated commands from
//! nearby clients, executes them, and reports state back upstream.
//!
//! Core functionalities of this crate include:
//!
//! - Pairing nearby clients over a short human-transcribed code and issuing
//!   the short-lived access tokens that authenticate their later requests
//! - Keeping a bounded, persistent blacklist of revoked local credentials
//! - Managing the typed component tree, its trait registry, the command
//!   queue and the per-component state-change journal
//! - Registering the device with the cloud service through a claim ticket
//!   and maintaining the OAuth credentials obtained in the process
//!
//! Platform concerns are injected through the [`provider`] interfaces:
//! an HTTP client, a persistent configuration store and a clock. The crate
//! leverages `tokio` as an asynchronous executor; delayed work such as
//! pairing-session expiry and access-token refresh runs as cancellable
//! background tasks.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Access tokens and the revocation blacklist.
pub mod auth;
/// The command queue and command instances.
pub mod commands;
/// The component tree manager and its state-change journal.
pub mod components;
/// Error management.
pub mod error;
/// Local pairing: key exchange and session orchestration.
pub mod pairing;
/// Platform provider interfaces and their stock implementations.
pub mod provider;
/// Cloud registration and credential lifecycle.
pub mod registration;
/// Device settings and their persistence.
pub mod settings;


use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

pub(crate) fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub(crate) fn b64_decode(data: &str) -> Option<Vec<u8>> {
    BASE64.decode(data).ok()
}
