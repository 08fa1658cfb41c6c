use crate::base::destination::{Address, Destination};
use crate::base::neterror::NetError;
use crate::socket::connectjob::Dial;
use crate::socket::tls::{self, TlsConfig};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::Arc;
use url::Url;

/// Request body type used for DNS exchanges.
pub type ExchangeBody = Full<Bytes>;

/// Wraps the underlying protocol stream (H1/H2).
pub enum HttpStream {
    Http1(http1::SendRequest<ExchangeBody>),
    Http2(http2::SendRequest<ExchangeBody>),
}

impl HttpStream {
    pub fn is_h2(&self) -> bool {
        matches!(self, HttpStream::Http2(_))
    }

    pub fn is_closed(&self) -> bool {
        match self {
            HttpStream::Http1(sender) => sender.is_closed(),
            HttpStream::Http2(sender) => sender.is_closed(),
        }
    }

    /// Another handle onto the same connection. Only HTTP/2 multiplexes.
    pub fn try_clone(&self) -> Option<HttpStream> {
        match self {
            HttpStream::Http1(_) => None,
            HttpStream::Http2(sender) => Some(HttpStream::Http2(sender.clone())),
        }
    }

    /// Wait until the connection can accept another request.
    pub async fn ready(&mut self) -> Result<(), NetError> {
        let result = match self {
            HttpStream::Http1(sender) => sender.ready().await,
            HttpStream::Http2(sender) => sender.ready().await,
        };
        result.map_err(|e| {
            tracing::debug!(error = %e, "pooled connection not ready");
            NetError::ConnectionClosed
        })
    }

    pub async fn send_request(
        &mut self,
        req: Request<ExchangeBody>,
    ) -> Result<Response<Incoming>, NetError> {
        let h2 = self.is_h2();
        let result = match self {
            HttpStream::Http1(sender) => sender.send_request(req).await,
            HttpStream::Http2(sender) => sender.send_request(req).await,
        };
        result.map_err(|e| {
            tracing::debug!(error = %e, h2, "request failed");
            if h2 {
                NetError::Http2ProtocolError
            } else {
                NetError::ConnectionClosed
            }
        })
    }
}

impl std::fmt::Debug for HttpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStream")
            .field("h2", &self.is_h2())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Opens HTTP connections: dial, optional TLS, then the protocol handshake
/// chosen by ALPN.
#[derive(Clone)]
pub struct HttpStreamFactory {
    dialer: Arc<dyn Dial>,
    tls: TlsConfig,
}

impl HttpStreamFactory {
    pub fn new(dialer: Arc<dyn Dial>, tls: TlsConfig) -> Self {
        Self { dialer, tls }
    }

    pub async fn request_stream(&self, url: &Url) -> Result<HttpStream, NetError> {
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let port = url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        let destination = Destination::tcp(Address::parse(host), port);

        let socket = self.dialer.dial(&destination).await?;

        let (socket, is_h2) = match url.scheme() {
            "https" => tls::connect(&self.tls, &destination.address.host(), socket).await?,
            "http" => (socket, false),
            _ => return Err(NetError::InvalidUrl),
        };

        let io = TokioIo::new(socket);
        if is_h2 {
            let (sender, conn) = http2::handshake(TokioExecutor::new(), io)
                .await
                .map_err(|_| NetError::Http2ProtocolError)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "h2 connection closed");
                }
            });
            Ok(HttpStream::Http2(sender))
        } else {
            let (sender, conn) = http1::handshake(io)
                .await
                .map_err(|_| NetError::ConnectionFailed)?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "h1 connection closed");
                }
            });
            Ok(HttpStream::Http1(sender))
        }
    }
}
