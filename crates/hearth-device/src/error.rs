use std::borrow::Cow;

pub use hearth::error::ErrorKind;

/// A specialized `Result` for device operations.
pub type Result<T> = std::result::Result<T, Error>;

type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The error type of all fallible device operations.
///
/// Carries the wire-visible [`ErrorKind`], a human-readable message, and
/// optionally the lower-level error that caused it.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Cow<'static, str>,
    source: Option<Source>,
}

impl Error {
    /// Creates an [`Error`] from a kind and a message.
    #[must_use]
    #[inline]
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an [`Error`] chained with the lower-level error that
    /// caused it.
    #[must_use]
    #[inline]
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<Cow<'static, str>>,
        source: impl Into<Source>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Returns the wire-visible kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn std::error::Error + 'static))
    }
}

// Sources are context, not identity.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl From<hearth::component::TreeError> for Error {
    fn from(error: hearth::component::TreeError) -> Self {
        Self::new(error.kind, error.message)
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};

    #[test]
    fn display_includes_kind() {
        let error = Error::new(ErrorKind::DeviceBusy, "Too many pairing attempts");
        assert_eq!(error.to_string(), "deviceBusy: Too many pairing attempts");
        assert_eq!(error.kind(), ErrorKind::DeviceBusy);
    }

    #[test]
    fn equality_ignores_source() {
        let plain = Error::new(ErrorKind::NetworkError, "request failed");
        let chained = Error::with_source(
            ErrorKind::NetworkError,
            "request failed",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        );
        assert_eq!(plain, chained);
        assert!(std::error::Error::source(&chained).is_some());
        assert!(std::error::Error::source(&plain).is_none());
    }
}
