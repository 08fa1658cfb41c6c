use crate::base::neterror::NetError;
use crate::dns::{GaiResolver, Name, QueryStrategy, Resolve};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Deadline applied by [`LocalTransport::lookup_default`].
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Lookup-only transport backed by a host resolver. It never carries wire
/// messages.
#[derive(Clone)]
pub struct LocalTransport {
    resolver: Arc<dyn Resolve>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(Arc::new(GaiResolver::new()))
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport").finish_non_exhaustive()
    }
}

impl LocalTransport {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self { resolver }
    }

    /// Resolve `domain`, keeping only the families `strategy` allows.
    pub async fn lookup(
        &self,
        domain: &str,
        strategy: QueryStrategy,
    ) -> Result<Vec<IpAddr>, NetError> {
        let name = Name::new(domain);
        if let Some(ip) = name.as_ip() {
            return if strategy.accepts(&ip) {
                Ok(vec![ip])
            } else {
                Err(NetError::AddressInvalid)
            };
        }

        let addrs = self.resolver.resolve(name).await?;
        let ips = strategy.filter(addrs.map(|addr| addr.ip()));
        if ips.is_empty() {
            tracing::debug!(domain = %domain, ?strategy, "no addresses for requested family");
            return Err(NetError::dns_failed(
                domain,
                io::Error::new(io::ErrorKind::NotFound, "no addresses for requested family"),
            ));
        }
        Ok(ips)
    }

    /// [`lookup`](Self::lookup) for both families under [`DEFAULT_LOOKUP_TIMEOUT`].
    pub async fn lookup_default(&self, domain: &str) -> Result<Vec<IpAddr>, NetError> {
        tokio::time::timeout(DEFAULT_LOOKUP_TIMEOUT, self.lookup(domain, QueryStrategy::UseIp))
            .await
            .map_err(|_| NetError::ConnectionTimedOut)?
    }
}
