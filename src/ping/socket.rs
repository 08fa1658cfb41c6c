//! Shared ICMP sockets.
//!
//! [`PacketListener`] opens one [`PacketConn`] per address family; the
//! manager owns it and runs the only reader. [`IcmpListener`] is the system
//! implementation on top of `socket2`.

use crate::base::context::IoResultExt;
use crate::base::destination::IpFamily;
use crate::base::neterror::NetError;
use crate::ping::config::{PingConfig, PingProtocol};
use futures::future::BoxFuture;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// A connectionless packet socket carrying ICMP echo messages.
///
/// Received packets start at the ICMP header.
pub trait PacketConn: Send + Sync {
    fn send_to<'a>(&'a self, packet: &'a [u8], target: IpAddr) -> BoxFuture<'a, io::Result<usize>>;

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, IpAddr)>>;
}

/// Opens the shared socket for an address family.
pub trait PacketListener: Send + Sync {
    fn listen(&self, family: IpFamily) -> Result<Arc<dyn PacketConn>, NetError>;
}

/// Opens ICMP sockets bound to the configured gateway addresses.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct IcmpListener {
    config: PingConfig,
}

impl IcmpListener {
    pub fn new(config: PingConfig) -> Self {
        Self { config }
    }
}

impl PacketListener for IcmpListener {
    fn listen(&self, family: IpFamily) -> Result<Arc<dyn PacketConn>, NetError> {
        let bind = self.config.bind_addr(family);
        let (domain, protocol) = match family {
            IpFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
            IpFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let ty = match self.config.protocol {
            PingProtocol::Default => Type::RAW,
            PingProtocol::Unprivileged => Type::DGRAM,
        };

        let socket = Socket::new(domain, ty, Some(protocol)).listen_context(bind)?;
        socket.set_nonblocking(true).listen_context(bind)?;
        socket.bind(&SocketAddr::new(bind, 0).into()).listen_context(bind)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).listen_context(bind)?;

        tracing::debug!(bind = %bind, protocol = %self.config.protocol, "opened echo socket");
        Ok(Arc::new(IcmpConn {
            socket,
            strip_ip_header: family == IpFamily::V4 && self.config.protocol.is_privileged(),
        }))
    }
}

struct IcmpConn {
    socket: UdpSocket,
    /// Raw IPv4 sockets deliver the IP header with every packet.
    strip_ip_header: bool,
}

impl PacketConn for IcmpConn {
    fn send_to<'a>(&'a self, packet: &'a [u8], target: IpAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(self.socket.send_to(packet, SocketAddr::new(target, 0)))
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, IpAddr)>> {
        Box::pin(async move {
            let (n, from) = self.socket.recv_from(buf).await?;
            if !self.strip_ip_header {
                return Ok((n, from.ip()));
            }

            let n = strip_ipv4_header(buf, n).unwrap_or_else(|| {
                tracing::trace!(source = %from.ip(), len = n, "dropping truncated IPv4 packet");
                0
            });
            Ok((n, from.ip()))
        })
    }
}

/// Move the ICMP message in `buf[..n]` to the front, past its IPv4 header.
/// Returns the message length, or `None` when the header is malformed.
fn strip_ipv4_header(buf: &mut [u8], n: usize) -> Option<usize> {
    let header_len = usize::from(buf.first()? & 0x0f) * 4;
    if header_len < 20 || n < header_len {
        return None;
    }
    buf.copy_within(header_len..n, 0);
    Some(n - header_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_ipv4_header() {
        let mut buf = [0u8; 32];
        buf[0] = 0x45;
        buf[20..28].copy_from_slice(&[0, 0, 0xff, 0xff, 0, 0, 0, 1]);

        assert_eq!(strip_ipv4_header(&mut buf, 28), Some(8));
        assert_eq!(&buf[..8], &[0, 0, 0xff, 0xff, 0, 0, 0, 1]);
    }

    #[test]
    fn test_strip_ipv4_header_honours_options() {
        let mut buf = [0u8; 40];
        buf[0] = 0x46;
        buf[24] = 0xaa;

        assert_eq!(strip_ipv4_header(&mut buf, 32), Some(8));
        assert_eq!(buf[0], 0xaa);
    }

    #[test]
    fn test_truncated_ipv4_header_is_skipped() {
        let mut short = [0x45u8, 0, 0, 0];
        assert_eq!(strip_ipv4_header(&mut short, 4), None);

        let mut bad_ihl = [0x41u8; 24];
        assert_eq!(strip_ipv4_header(&mut bad_ihl, 24), None);

        assert_eq!(strip_ipv4_header(&mut [], 0), None);
    }
}
