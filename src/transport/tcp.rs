use crate::base::destination::Destination;
use crate::base::neterror::NetError;
use crate::socket::cache::{ConnectionCache, InboundFraming};
use crate::socket::connectjob::{Dial, SystemDialer};
use crate::socket::tls::{TlsConfig, TlsDialer};
use crate::transport::framing::frame_message;
use crate::transport::TransportContext;
use std::sync::Arc;

/// DNS over a byte stream (TCP or TLS) with 2-byte length framing.
///
/// Replies are reassembled by the cache's reader and delivered to the
/// write-back without their length prefix.
#[derive(Debug, Clone)]
pub struct FramedTransport {
    destination: Destination,
    cache: ConnectionCache,
}

impl FramedTransport {
    pub fn tcp(ctx: TransportContext, dialer: Arc<dyn Dial>) -> Self {
        let cache = ConnectionCache::new(dialer, InboundFraming::LengthPrefixed, ctx.write_back);
        Self {
            destination: ctx.destination,
            cache,
        }
    }

    pub fn tcp_local(ctx: TransportContext) -> Self {
        Self::tcp(ctx, Arc::new(SystemDialer::new()))
    }

    /// DNS-over-TLS: `dialer` supplies the raw stream, the handshake is bound
    /// to the destination host.
    pub fn tls(ctx: TransportContext, dialer: Arc<dyn Dial>, config: TlsConfig) -> Self {
        Self::tcp(ctx, Arc::new(TlsDialer::new(dialer, config)))
    }

    pub fn tls_local(ctx: TransportContext) -> Self {
        Self::tls(ctx, Arc::new(SystemDialer::new()), TlsConfig::dns())
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    pub async fn write_raw(&self, packed: &[u8]) -> Result<(), NetError> {
        let framed = frame_message(packed)?;
        self.cache.write(&self.destination, &framed).await
    }
}
