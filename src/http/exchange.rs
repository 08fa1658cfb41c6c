//! Pooled HTTP client for DNS-over-HTTPS exchanges (RFC 8484).
//!
//! Each exchange POSTs one wire-format DNS message and returns the raw reply.
//! Connections are kept per (scheme, host, port): HTTP/2 connections stay in
//! the pool and are shared, HTTP/1.1 connections are checked out for one
//! exchange at a time and returned once the response body has been drained.

use crate::base::neterror::NetError;
use crate::http::streamfactory::{ExchangeBody, HttpStream, HttpStreamFactory};
use crate::socket::connectjob::Dial;
use crate::socket::tls::TlsConfig;
use bytes::Bytes;
use dashmap::DashMap;
use http::header::{ACCEPT, CONTENT_TYPE, HOST};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

pub const DNS_MESSAGE_MIME: &str = "application/dns-message";

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Tunables for [`ExchangeClient`].
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Idle connections kept across all hosts.
    pub max_idle_conns: usize,
    pub idle_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    /// Deadline for a whole exchange, connection setup included.
    pub request_timeout: Duration,
    /// Offer `h2` via ALPN.
    pub attempt_http2: bool,
    /// Verify the server certificate and host name.
    pub verify_peer: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 30,
            idle_timeout: Duration::from_secs(300),
            tls_handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            attempt_http2: true,
            verify_peer: true,
        }
    }
}

impl ExchangeConfig {
    pub fn with_max_idle_conns(mut self, max: usize) -> Self {
        self.max_idle_conns = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls_handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_http2(mut self, enabled: bool) -> Self {
        self.attempt_http2 = enabled;
        self
    }

    pub fn with_verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    fn tls_config(&self) -> TlsConfig {
        let mut tls = TlsConfig::https()
            .handshake_timeout(self.tls_handshake_timeout)
            .verify_peer(self.verify_peer);
        if !self.attempt_http2 {
            tls.alpn_protos = vec!["http/1.1".to_string()];
        }
        tls
    }
}

/// Identifies a connection group (scheme, host, port).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupId {
    scheme: String,
    host: String,
    port: u16,
}

impl GroupId {
    fn from_url(url: &Url) -> Option<Self> {
        Some(GroupId {
            scheme: url.scheme().to_string(),
            host: url.host_str()?.to_string(),
            port: url.port_or_known_default()?,
        })
    }
}

struct IdleStream {
    stream: HttpStream,
    since: Instant,
}

impl IdleStream {
    fn new(stream: HttpStream) -> Self {
        Self {
            stream,
            since: Instant::now(),
        }
    }

    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.stream.is_closed() || self.since.elapsed() >= idle_timeout
    }
}

/// Connections parked between exchanges.
///
/// Shared with the cleanup task, which only holds a weak reference.
struct IdlePool {
    streams: DashMap<GroupId, VecDeque<IdleStream>>,
    total: AtomicUsize,
    max_idle: usize,
    idle_timeout: Duration,
}

impl IdlePool {
    fn new(config: &ExchangeConfig) -> Self {
        Self {
            streams: DashMap::new(),
            total: AtomicUsize::new(0),
            max_idle: config.max_idle_conns,
            idle_timeout: config.idle_timeout,
        }
    }

    fn checkout(&self, group: &GroupId) -> Option<HttpStream> {
        let mut streams = self.streams.get_mut(group)?;

        while let Some(idle) = streams.pop_front() {
            if idle.is_expired(self.idle_timeout) {
                self.total.fetch_sub(1, Ordering::Relaxed);
                continue;
            }

            if let Some(shared) = idle.stream.try_clone() {
                streams.push_front(IdleStream::new(idle.stream));
                return Some(shared);
            }

            self.total.fetch_sub(1, Ordering::Relaxed);
            return Some(idle.stream);
        }
        None
    }

    fn park(&self, group: GroupId, stream: HttpStream) {
        if self.total.load(Ordering::Relaxed) >= self.max_idle {
            return;
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        self.streams
            .entry(group)
            .or_default()
            .push_back(IdleStream::new(stream));
    }

    fn len(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    fn cleanup(&self) {
        let mut empty = Vec::new();

        for mut entry in self.streams.iter_mut() {
            let before = entry.len();
            entry.retain(|idle| !idle.is_expired(self.idle_timeout));
            let removed = before - entry.len();
            if removed > 0 {
                self.total.fetch_sub(removed, Ordering::Relaxed);
                tracing::trace!(host = %entry.key().host, removed, "expired idle DoH connections");
            }
            if entry.is_empty() {
                empty.push(entry.key().clone());
            }
        }

        for group in empty {
            self.streams.remove_if(&group, |_, streams| streams.is_empty());
        }
    }
}

/// Pooled DoH client.
pub struct ExchangeClient {
    factory: HttpStreamFactory,
    config: ExchangeConfig,
    pool: Arc<IdlePool>,
    cleanup_started: AtomicBool,
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("config", &self.config)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl ExchangeClient {
    pub fn new(dialer: Arc<dyn Dial>, config: ExchangeConfig) -> Self {
        let factory = HttpStreamFactory::new(dialer, config.tls_config());
        let pool = Arc::new(IdlePool::new(&config));
        Self {
            factory,
            config,
            pool,
            cleanup_started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// POST `message` to `url` and return the raw reply body.
    ///
    /// A non-200 status is an error; its body is still drained first so the
    /// connection can be reused.
    pub async fn exchange(&self, url: &Url, message: Bytes) -> Result<Bytes, NetError> {
        tokio::time::timeout(self.config.request_timeout, self.exchange_inner(url, message))
            .await
            .map_err(|_| {
                tracing::debug!(
                    url = %url,
                    timeout = ?self.config.request_timeout,
                    "exchange timed out"
                );
                NetError::ConnectionTimedOut
            })?
    }

    async fn exchange_inner(&self, url: &Url, message: Bytes) -> Result<Bytes, NetError> {
        let group = GroupId::from_url(url).ok_or(NetError::InvalidUrl)?;

        let mut stream = match self.pool.checkout(&group) {
            Some(mut pooled) => match pooled.ready().await {
                Ok(()) => pooled,
                Err(_) => self.connect(url, &group).await?,
            },
            None => self.connect(url, &group).await?,
        };

        let request = build_request(url, message, stream.is_h2())?;
        let response = stream.send_request(request).await?;
        let status = response.status();

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                tracing::debug!(url = %url, error = %e, "failed to read response body");
                NetError::InvalidResponse
            })?
            .to_bytes();

        self.release(group, stream);

        if status != StatusCode::OK {
            tracing::debug!(
                url = %url,
                status = status.as_u16(),
                "DoH server returned error status"
            );
            return Err(NetError::HttpStatus(status.as_u16()));
        }
        Ok(body)
    }

    async fn connect(&self, url: &Url, group: &GroupId) -> Result<HttpStream, NetError> {
        let mut stream = self.factory.request_stream(url).await?;
        stream.ready().await?;
        if let Some(shared) = stream.try_clone() {
            self.park(group.clone(), shared);
        }
        Ok(stream)
    }

    fn release(&self, group: GroupId, stream: HttpStream) {
        // HTTP/2 handles are never checked out; the pooled copy stays put.
        if stream.is_h2() || stream.is_closed() {
            return;
        }
        self.park(group, stream);
    }

    fn park(&self, group: GroupId, stream: HttpStream) {
        self.pool.park(group, stream);
        self.start_cleanup_task();
    }

    /// Periodically expire idle connections. Started on the first park and
    /// stops once the client is dropped.
    fn start_cleanup_task(&self) {
        if self.cleanup_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let interval = self
            .config
            .idle_timeout
            .clamp(MIN_CLEANUP_INTERVAL, CLEANUP_INTERVAL);
        let pool = Arc::downgrade(&self.pool);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match pool.upgrade() {
                    Some(pool) => pool.cleanup(),
                    None => break,
                }
            }
        });
    }

    /// Number of pooled connections.
    pub fn idle_count(&self) -> usize {
        self.pool.len()
    }

    /// Drop pooled connections that are closed or past the idle timeout.
    pub fn cleanup_idle(&self) {
        self.pool.cleanup();
    }
}

fn build_request(url: &Url, message: Bytes, h2: bool) -> Result<Request<ExchangeBody>, NetError> {
    let builder = Request::builder()
        .method(Method::POST)
        .header(ACCEPT, DNS_MESSAGE_MIME)
        .header(CONTENT_TYPE, DNS_MESSAGE_MIME);

    let builder = if h2 {
        builder.uri(url.as_str())
    } else {
        let authority = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().ok_or(NetError::InvalidUrl)?, port),
            None => url.host_str().ok_or(NetError::InvalidUrl)?.to_string(),
        };
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        builder.uri(path).header(HOST, authority)
    };

    builder.body(Full::new(message)).map_err(|_| NetError::InvalidUrl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExchangeConfig::default();
        assert_eq!(config.max_idle_conns, 30);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.tls_handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert!(config.attempt_http2);
        assert!(config.verify_peer);
    }

    #[test]
    fn test_tls_config_respects_http2_flag() {
        let with_h2 = ExchangeConfig::default().tls_config();
        assert_eq!(with_h2.alpn_protos, vec!["h2", "http/1.1"]);

        let without_h2 = ExchangeConfig::default().with_http2(false).tls_config();
        assert_eq!(without_h2.alpn_protos, vec!["http/1.1"]);

        let unverified = ExchangeConfig::default().with_verify_peer(false).tls_config();
        assert!(!unverified.verify_peer);
    }

    #[test]
    fn test_build_request_h1_origin_form() {
        let url = Url::parse("https://dns.example:8443/dns-query?ct").unwrap();
        let req = build_request(&url, Bytes::from_static(b"\x00\x01"), false).unwrap();

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), "/dns-query?ct");
        assert_eq!(req.headers()[HOST], "dns.example:8443");
        assert_eq!(req.headers()[ACCEPT], DNS_MESSAGE_MIME);
        assert_eq!(req.headers()[CONTENT_TYPE], DNS_MESSAGE_MIME);
    }

    #[test]
    fn test_build_request_h2_absolute() {
        let url = Url::parse("https://dns.example/dns-query").unwrap();
        let req = build_request(&url, Bytes::new(), true).unwrap();
        assert_eq!(req.uri(), "https://dns.example/dns-query");
        assert!(req.headers().get(HOST).is_none());
    }

    #[test]
    fn test_group_id_default_port() {
        let id = GroupId::from_url(&Url::parse("https://dns.example/dns-query").unwrap()).unwrap();
        assert_eq!(id.port, 443);
    }
}
