//! Interfaces towards the platform the device runs on.
//!
//! The device core never talks to the network, the filesystem or the wall
//! clock directly; everything goes through the traits below so integrators
//! can substitute their own transports and tests can substitute fakes.

mod clock;
mod http;
mod store;

pub use clock::{Clock, SystemClock};
pub use http::{
    HttpClient, Method, ReqwestHttpClient, Request, Response, CONTENT_TYPE_FORM, CONTENT_TYPE_JSON,
};
pub use store::{ConfigStore, FileConfigStore, MemoryConfigStore};
