//! Outbound dialing: DNS -> TCP/UDP socket.
//!
//! [`Dial`] is the seam through which the connection cache and the DoH client
//! obtain their underlying sockets. [`SystemDialer`] talks to the operating
//! system; routers or tests can plug in their own via [`DialFn`].

use crate::base::context::IoResultExt;
use crate::base::destination::{Address, Destination, Network};
use crate::base::neterror::NetError;
use crate::dns::{GaiResolver, Name, Resolve};
use crate::socket::stream::{BoxedSocket, DatagramSocket};
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};

/// TCP keepalive idle time applied to dialed stream sockets.
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(15);

/// Alias for the `Future` type returned by a dialer.
pub type Dialing = Pin<Box<dyn Future<Output = Result<BoxedSocket, NetError>> + Send>>;

/// Produces a connected socket for a destination.
pub trait Dial: Send + Sync {
    fn dial(&self, destination: &Destination) -> Dialing;
}

impl<D: Dial + ?Sized> Dial for Arc<D> {
    fn dial(&self, destination: &Destination) -> Dialing {
        (**self).dial(destination)
    }
}

/// Adapts a closure into a [`Dial`].
pub struct DialFn<F>(pub F);

impl<F, Fut> Dial for DialFn<F>
where
    F: Fn(Destination) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BoxedSocket, NetError>> + Send + 'static,
{
    fn dial(&self, destination: &Destination) -> Dialing {
        Box::pin((self.0)(destination.clone()))
    }
}

/// Dials through the operating system's sockets.
///
/// Domains are resolved through the configured [`Resolve`]; each resolved
/// address is tried in order until one connects.
#[derive(Clone)]
pub struct SystemDialer {
    resolver: Arc<dyn Resolve>,
    keepalive: Option<Duration>,
}

impl Default for SystemDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemDialer").field("keepalive", &self.keepalive).finish_non_exhaustive()
    }
}

impl SystemDialer {
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(GaiResolver::new()),
            keepalive: Some(TCP_KEEPALIVE),
        }
    }

    pub fn with_resolver(resolver: Arc<dyn Resolve>) -> Self {
        Self {
            resolver,
            keepalive: Some(TCP_KEEPALIVE),
        }
    }

    /// Override TCP keepalive; `None` leaves the system default.
    pub fn keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    async fn resolve(
        resolver: Arc<dyn Resolve>,
        destination: &Destination,
    ) -> Result<Vec<SocketAddr>, NetError> {
        match &destination.address {
            Address::Ip(ip) => Ok(vec![SocketAddr::new(*ip, destination.port)]),
            Address::Domain(domain) => {
                let addrs = resolver.resolve(Name::new(domain.as_str())).await?;
                Ok(addrs.map(|a| SocketAddr::new(a.ip(), destination.port)).collect())
            }
        }
    }

    async fn connect_tcp(
        addrs: Vec<SocketAddr>,
        host: &str,
        port: u16,
        keepalive: Option<Duration>,
    ) -> Result<BoxedSocket, NetError> {
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).connection_context(host, port)?;
                    if let Some(idle) = keepalive {
                        SockRef::from(&stream)
                            .set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))
                            .connection_context(host, port)?;
                    }
                    tracing::debug!(host = %host, addr = %addr, "tcp connected");
                    return Ok(BoxedSocket::new(stream));
                }
                Err(e) => {
                    tracing::debug!(host = %host, addr = %addr, error = %e, "tcp connect failed");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e).connection_context(host, port),
            None => Err(NetError::NameNotResolved),
        }
    }

    async fn connect_udp(
        addrs: Vec<SocketAddr>,
        host: &str,
        port: u16,
    ) -> Result<BoxedSocket, NetError> {
        let addr = addrs.into_iter().next().ok_or(NetError::NameNotResolved)?;
        let local: IpAddr = match addr {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };

        let socket = UdpSocket::bind(SocketAddr::new(local, 0))
            .await
            .connection_context(host, port)?;
        socket.connect(addr).await.connection_context(host, port)?;
        tracing::debug!(host = %host, addr = %addr, "udp connected");
        Ok(BoxedSocket::new(DatagramSocket::new(socket)))
    }
}

impl Dial for SystemDialer {
    fn dial(&self, destination: &Destination) -> Dialing {
        let resolver = Arc::clone(&self.resolver);
        let keepalive = self.keepalive;
        let destination = destination.clone();

        Box::pin(async move {
            let addrs = Self::resolve(resolver, &destination).await?;
            let host = destination.address.host();
            match destination.network {
                Network::Tcp => Self::connect_tcp(addrs, &host, destination.port, keepalive).await,
                Network::Udp => Self::connect_udp(addrs, &host, destination.port).await,
            }
        })
    }
}
