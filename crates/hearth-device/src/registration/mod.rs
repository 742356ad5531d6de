//! Cloud registration and credential lifecycle: the claim-ticket flow,
//! access-token refresh, and the publishing of commands and journalled
//! state to the cloud service.

mod backoff;
mod manager;

pub use backoff::Backoff;
pub use manager::{CloudState, RegistrationManager};
