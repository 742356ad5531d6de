//! The capability model shared among a `hearth` device and its clients.
//!
//! This crate provides the data types that describe what a device *is* and
//! what it can *do*:
//!
//! - Access roles and the identity carried by local credentials.
//! - Trait definitions: reusable bundles of commands and state properties
//!   that a component can declare.
//! - The component tree: named nodes declaring traits and carrying their
//!   state, addressed by dotted paths with `[i]` array indices.
//! - Command states and origins for the device command pipeline.
//! - The wire messages of the local pairing API.
//! - The error kinds that cross the wire, with their exact wire spelling.
//!
//! Data exchange between a device and its clients requires these structures
//! to be serializable and deserializable, so everything here derives the
//! `serde` traits. The runtime machinery that mutates this model lives in
//! the `hearth-device` crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Command states and origins.
pub mod command;
/// The component tree and dotted-path navigation.
pub mod component;
/// Error kinds crossing the wire.
pub mod error;
/// Wire messages of the local pairing API.
pub mod pairing;
/// Access roles and local user identity.
pub mod role;
/// Trait definitions and command names.
pub mod traits;

#[cfg(test)]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}

#[cfg(test)]
pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap()
}
