//! DNS wire transports.
//!
//! Each variant of [`Transport`] speaks one wire convention:
//! - `Udp`: bare message per datagram
//! - `Tcp` / `Tls`: 2-byte length prefix over a stream
//! - `Https`: RFC 8484 POST exchange
//! - `Local`: no wire at all, answers lookups through the host resolver
//!
//! The stream and datagram variants share a [`ConnectionCache`] keyed by
//! destination; replies arrive asynchronously at the context's write-back.
//! Callers branch on [`TransportKind`] rather than on the variant.
//!
//! [`ConnectionCache`]: crate::socket::cache::ConnectionCache

pub mod framing;
pub mod https;
pub mod local;
pub mod tcp;
pub mod udp;

pub use https::HttpsTransport;
pub use local::LocalTransport;
pub use tcp::FramedTransport;
pub use udp::DatagramTransport;

use crate::base::destination::Destination;
use crate::base::neterror::NetError;
use crate::dns::{QueryStrategy, Resolve};
use crate::http::exchange::ExchangeConfig;
use crate::socket::cache::WriteBack;
use crate::socket::connectjob::Dial;
use crate::socket::tls::TlsConfig;
use bytes::Bytes;
use hickory_resolver::proto::op::Message;
use std::net::IpAddr;
use std::sync::Arc;
use url::Url;

/// What a transport can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Fire-and-forget writes; replies come back through the write-back.
    Raw,
    /// Request/response: `exchange` returns the reply directly.
    Exchange,
    /// Only `lookup` is available.
    LookupOnly,
}

/// Per-transport wiring: where to send, and where replies go.
#[derive(Clone)]
pub struct TransportContext {
    pub destination: Destination,
    pub write_back: WriteBack,
}

impl TransportContext {
    pub fn new(destination: Destination, write_back: WriteBack) -> Self {
        Self {
            destination,
            write_back,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Transport {
    Udp(DatagramTransport),
    Tcp(FramedTransport),
    Tls(FramedTransport),
    Https(HttpsTransport),
    Local(LocalTransport),
}

impl Transport {
    pub fn udp(ctx: TransportContext, dialer: Arc<dyn Dial>) -> Self {
        Transport::Udp(DatagramTransport::new(ctx, dialer))
    }

    pub fn udp_local(ctx: TransportContext) -> Self {
        Transport::Udp(DatagramTransport::local(ctx))
    }

    pub fn tcp(ctx: TransportContext, dialer: Arc<dyn Dial>) -> Self {
        Transport::Tcp(FramedTransport::tcp(ctx, dialer))
    }

    pub fn tcp_local(ctx: TransportContext) -> Self {
        Transport::Tcp(FramedTransport::tcp_local(ctx))
    }

    pub fn tls(ctx: TransportContext, dialer: Arc<dyn Dial>) -> Self {
        Transport::Tls(FramedTransport::tls(ctx, dialer, TlsConfig::dns()))
    }

    pub fn tls_local(ctx: TransportContext) -> Self {
        Transport::Tls(FramedTransport::tls_local(ctx))
    }

    pub fn https(url: Url, write_back: WriteBack, dialer: Arc<dyn Dial>) -> Self {
        Transport::Https(HttpsTransport::new(url, write_back, dialer, ExchangeConfig::default()))
    }

    pub fn https_local(url: Url, write_back: WriteBack) -> Self {
        Transport::Https(HttpsTransport::local(url, write_back))
    }

    pub fn local(resolver: Arc<dyn Resolve>) -> Self {
        Transport::Local(LocalTransport::new(resolver))
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Udp(_) | Transport::Tcp(_) | Transport::Tls(_) => TransportKind::Raw,
            Transport::Https(_) => TransportKind::Exchange,
            Transport::Local(_) => TransportKind::LookupOnly,
        }
    }

    /// Encode and send `message`. Replies are delivered to the write-back.
    pub async fn write(&self, message: &Message) -> Result<(), NetError> {
        let packed = message.to_vec().map_err(|e| {
            tracing::debug!(error = %e, "failed to pack dns query");
            NetError::InvalidMessage
        })?;
        self.write_raw(&packed).await
    }

    /// Send an already wire-encoded message.
    pub async fn write_raw(&self, packed: &[u8]) -> Result<(), NetError> {
        match self {
            Transport::Udp(t) => t.write_raw(packed).await,
            Transport::Tcp(t) | Transport::Tls(t) => t.write_raw(packed).await,
            Transport::Https(t) => t.write_raw(packed).await,
            Transport::Local(_) => Err(NetError::NotSupported),
        }
    }

    /// Send `message` and wait for its reply.
    pub async fn exchange(&self, message: &Message) -> Result<Message, NetError> {
        let packed = message.to_vec().map_err(|_| NetError::InvalidMessage)?;
        let reply = self.exchange_raw(Bytes::from(packed)).await?;
        Message::from_vec(&reply).map_err(|e| {
            tracing::debug!(error = %e, "failed to parse dns reply");
            NetError::InvalidResponse
        })
    }

    pub async fn exchange_raw(&self, packed: Bytes) -> Result<Bytes, NetError> {
        match self {
            Transport::Https(t) => t.exchange_raw(packed).await,
            _ => Err(NetError::NotSupported),
        }
    }

    pub async fn lookup(
        &self,
        domain: &str,
        strategy: QueryStrategy,
    ) -> Result<Vec<IpAddr>, NetError> {
        match self {
            Transport::Local(t) => t.lookup(domain, strategy).await,
            _ => Err(NetError::NotSupported),
        }
    }

    /// Remote endpoint for transports that dial one.
    pub fn destination(&self) -> Option<&Destination> {
        match self {
            Transport::Udp(t) => Some(t.destination()),
            Transport::Tcp(t) | Transport::Tls(t) => Some(t.destination()),
            Transport::Https(_) | Transport::Local(_) => None,
        }
    }
}
