//! Async DNS resolver using hickory-dns.
//!
//! Unlike `GaiResolver`, this resolver is fully async and keeps its own
//! connection pool to the upstream name servers.

use super::{Addrs, Name, QueryStrategy, Resolve, Resolving};
use crate::base::neterror::NetError;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use std::{io, net::SocketAddr, sync::Arc};

/// Async DNS resolver backed by hickory-dns.
///
/// # Example
///
/// ```rust,ignore
/// use muxnet::dns::{HickoryResolver, Name, Resolve};
///
/// let resolver = HickoryResolver::new();
/// let addrs = resolver.resolve(Name::new("example.com")).await?;
/// ```
#[derive(Debug, Clone)]
pub struct HickoryResolver {
    resolver: Arc<TokioResolver>,
}

impl HickoryResolver {
    /// Uses the system configuration, falling back to hickory's defaults when
    /// it cannot be read. Queries both address families.
    pub fn new() -> Self {
        Self::with_strategy(QueryStrategy::UseIp)
    }

    pub fn with_strategy(strategy: QueryStrategy) -> Self {
        let mut builder = match TokioResolver::builder_tokio() {
            Ok(builder) => builder,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read system DNS config, using defaults");
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
            }
        };

        builder.options_mut().ip_strategy = match strategy {
            QueryStrategy::UseIp => LookupIpStrategy::Ipv4AndIpv6,
            QueryStrategy::UseIp4 => LookupIpStrategy::Ipv4Only,
            QueryStrategy::UseIp6 => LookupIpStrategy::Ipv6Only,
        };

        Self {
            resolver: Arc::new(builder.build()),
        }
    }

    /// Resolve through explicitly configured upstream servers.
    pub fn with_config(config: ResolverConfig) -> Self {
        let builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        Self {
            resolver: Arc::new(builder.build()),
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolve for HickoryResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = Arc::clone(&self.resolver);
        Box::pin(async move {
            let domain = name.as_str();
            tracing::debug!(domain = %domain, "resolving via hickory-dns");

            let lookup = resolver.lookup_ip(domain).await.map_err(|e| {
                tracing::debug!(domain = %domain, error = %e, "hickory-dns lookup failed");
                NetError::dns_failed(domain, io::Error::new(io::ErrorKind::NotFound, e.to_string()))
            })?;

            let addrs: Vec<SocketAddr> = lookup.iter().map(|ip| SocketAddr::new(ip, 0)).collect();
            if addrs.is_empty() {
                return Err(NetError::dns_failed(
                    domain,
                    io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
                ));
            }

            tracing::debug!(
                domain = %domain,
                count = addrs.len(),
                "hickory-dns resolution complete"
            );
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}
