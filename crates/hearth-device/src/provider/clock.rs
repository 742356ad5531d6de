use chrono::{DateTime, Utc};

/// A source of the current time.
///
/// All timestamps the core produces come from an injected clock so tests
/// can pin time to a fixed value.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
