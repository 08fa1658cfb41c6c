use crate::base::destination::Destination;
use crate::base::neterror::NetError;
use crate::socket::cache::{ConnectionCache, InboundFraming};
use crate::socket::connectjob::{Dial, SystemDialer};
use crate::transport::TransportContext;
use std::sync::Arc;

/// Plain DNS over UDP: one message per datagram, no framing.
#[derive(Debug, Clone)]
pub struct DatagramTransport {
    destination: Destination,
    cache: ConnectionCache,
}

impl DatagramTransport {
    pub fn new(ctx: TransportContext, dialer: Arc<dyn Dial>) -> Self {
        let cache = ConnectionCache::new(dialer, InboundFraming::Datagram, ctx.write_back);
        Self {
            destination: ctx.destination,
            cache,
        }
    }

    /// Dial the destination directly through system sockets.
    pub fn local(ctx: TransportContext) -> Self {
        Self::new(ctx, Arc::new(SystemDialer::new()))
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    pub async fn write_raw(&self, packed: &[u8]) -> Result<(), NetError> {
        self.cache.write(&self.destination, packed).await
    }
}
