//! Raw ICMP echo multiplexing.
//!
//! - [`manager`]: `PingManager`, owner of the shared sockets and clients
//! - [`client`]: per-destination sequence allocation and reply correlation
//! - [`conn`]: the per-flow `VirtualEchoConnection`
//! - [`packet`]: echo header access and checksum arithmetic
//! - [`socket`]: the socket seam and the `socket2`-backed ICMP listener
//! - [`config`]: bind addresses and socket protocol selection

pub mod client;
pub mod config;
pub mod conn;
pub mod manager;
pub mod packet;
pub mod socket;

pub use client::EchoClient;
pub use config::{PingConfig, PingProtocol};
pub use conn::VirtualEchoConnection;
pub use manager::PingManager;
pub use socket::{IcmpListener, PacketConn, PacketListener};
