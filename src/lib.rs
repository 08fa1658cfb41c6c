//! # muxnet
//!
//! Outbound connection multiplexing for DNS transports and ICMP echo.
//!
//! `muxnet` keeps one live connection per destination and shares it between
//! every caller that talks to that destination. Two halves are built on the
//! same idle-timer and cancellation primitives:
//!
//! - **DNS transports**: UDP, TCP and TLS (RFC 7766 framing) over a
//!   dispatched-connection cache, DNS-over-HTTPS over a pooled hyper client,
//!   and a lookup-only local transport.
//! - **Echo multiplexing**: many logical ping flows over one raw ICMP socket
//!   per address family, correlated by rewritten sequence numbers.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use muxnet::base::destination::Destination;
//! use muxnet::socket::connectjob::SystemDialer;
//! use muxnet::transport::{Transport, TransportContext};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let dest: Destination = "udp:1.1.1.1:53".parse().unwrap();
//!     let ctx = TransportContext::new(dest, Arc::new(|reply| println!("{} bytes", reply.len())));
//!     let transport = Transport::udp(ctx, Arc::new(SystemDialer::new()));
//!     transport.write_raw(&query_bytes()).await.unwrap();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Errors, destinations and the activity timer
//! - [`dns`] - Host name resolution used by dialers and the local transport
//! - [`socket`] - Dialing, TLS and the dispatched-connection cache
//! - [`http`] - HTTP/1.1 and HTTP/2 exchange client for DNS-over-HTTPS
//! - [`transport`] - The DNS wire transports
//! - [`ping`] - The raw echo multiplexer

pub mod base;
pub mod dns;
pub mod http;
pub mod ping;
pub mod socket;
pub mod transport;
