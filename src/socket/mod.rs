//! Socket and connection management.
//!
//! - [`stream`]: the `StreamSocket` abstraction and boxed sockets
//! - [`connectjob`]: the `Dial` seam and the system dialer (DNS → TCP/UDP)
//! - [`tls`]: TLS configuration and the TLS-wrapping dialer (BoringSSL)
//! - [`cache`]: the dispatched-connection cache shared by the DNS transports

pub mod cache;
pub mod connectjob;
pub mod stream;
pub mod tls;
