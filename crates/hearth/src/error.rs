use serde::{Deserialize, Serialize};

/// All error kinds that may be reported to a caller, local or cloud.
///
/// The serialized form of each kind is its exact wire spelling; the mixed
/// naming conventions are part of the protocol and must not be normalized.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A request carried malformed or unacceptable parameters.
    #[serde(rename = "invalidParams")]
    InvalidParams,
    /// The referenced pairing session does not exist.
    #[serde(rename = "unknownSession")]
    UnknownSession,
    /// A payload could not be decoded.
    #[serde(rename = "invalidFormat")]
    InvalidFormat,
    /// The peer's key-exchange commitment could not be processed.
    #[serde(rename = "commitmentMismatch")]
    CommitmentMismatch,
    /// The device refuses further pairing attempts for a while.
    #[serde(rename = "deviceBusy")]
    DeviceBusy,
    /// An access token or pairing auth code failed validation.
    #[serde(rename = "invalid_auth_code")]
    InvalidAuthCode,
    /// The caller's role is insufficient, or the credential is revoked.
    #[serde(rename = "access_denied")]
    AccessDenied,
    /// The target component does not declare the command's trait.
    #[serde(rename = "trait_not_supported")]
    TraitNotSupported,
    /// No component exists at the given path.
    #[serde(rename = "component_not_found")]
    ComponentNotFound,
    /// No command definition exists under the given `trait.command` name.
    #[serde(rename = "invalidCommandName")]
    InvalidCommandName,
    /// A property value is unacceptable, e.g. an undefined trait name.
    #[serde(rename = "invalidPropValue")]
    InvalidPropValue,
    /// A value has the wrong JSON shape.
    #[serde(rename = "typeMismatch")]
    TypeMismatch,
    /// A referenced property or path element is missing.
    #[serde(rename = "propertyMissing")]
    PropertyMissing,
    /// The operation is not valid in the current state.
    #[serde(rename = "invalidState")]
    InvalidState,
    /// The device already holds cloud credentials.
    #[serde(rename = "already_registered")]
    AlreadyRegistered,
    /// The revocation entry expired before it was installed.
    #[serde(rename = "already_expired")]
    AlreadyExpired,
    /// The cloud rejected the refresh token; re-registration is required.
    #[serde(rename = "invalid_grant")]
    InvalidGrant,
    /// The OAuth endpoint rejected the request for another reason.
    #[serde(rename = "unable_to_authenticate")]
    UnableToAuthenticate,
    /// The transport failed or the peer answered with garbage.
    #[serde(rename = "network_error")]
    NetworkError,
}

impl ErrorKind {
    /// Returns the wire spelling of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidParams => "invalidParams",
            Self::UnknownSession => "unknownSession",
            Self::InvalidFormat => "invalidFormat",
            Self::CommitmentMismatch => "commitmentMismatch",
            Self::DeviceBusy => "deviceBusy",
            Self::InvalidAuthCode => "invalid_auth_code",
            Self::AccessDenied => "access_denied",
            Self::TraitNotSupported => "trait_not_supported",
            Self::ComponentNotFound => "component_not_found",
            Self::InvalidCommandName => "invalidCommandName",
            Self::InvalidPropValue => "invalidPropValue",
            Self::TypeMismatch => "typeMismatch",
            Self::PropertyMissing => "propertyMissing",
            Self::InvalidState => "invalidState",
            Self::AlreadyRegistered => "already_registered",
            Self::AlreadyExpired => "already_expired",
            Self::InvalidGrant => "invalid_grant",
            Self::UnableToAuthenticate => "unable_to_authenticate",
            Self::NetworkError => "network_error",
        }
    }
}

impl core::fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.as_str().fmt(f)
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        self.as_str().fmt(f)
    }
}
