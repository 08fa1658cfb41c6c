//! DNS Resolution Module
//!
//! Pluggable name resolution used by the system dialer and the lookup-only
//! local transport:
//! - System resolver (getaddrinfo via thread pool)
//! - Async hickory-dns resolver
//! - Hostname-to-IP override mechanism
//!
//! The wire-level DNS message type used by the transports is
//! `hickory_resolver::proto::op::Message`.

mod gai;
mod hickory;
mod resolve;

pub use gai::GaiResolver;
pub use hickory::HickoryResolver;
pub use resolve::{Addrs, DnsResolverWithOverrides, Name, QueryStrategy, Resolve, Resolving};
