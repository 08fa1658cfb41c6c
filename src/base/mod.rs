//! Base types and error handling.
//!
//! - [`neterror::NetError`]: network error codes shared by every layer
//! - [`destination::Destination`]: the identity used to key cached resources
//! - [`timer::ActivityTimer`]: idle expiry for cached connections and echo clients

pub mod context;
pub mod destination;
pub mod neterror;
pub mod timer;
