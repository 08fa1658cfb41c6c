use crate::base::destination::Destination;
use crate::base::neterror::NetError;
use crate::socket::connectjob::{Dial, Dialing};
use crate::socket::stream::BoxedSocket;
use boring::ssl::{SslConnector, SslConnectorBuilder, SslMethod, SslVerifyMode, SslVersion};
use std::sync::Arc;
use std::time::Duration;

/// Default handshake deadline for TLS-wrapped DNS and DoH connections.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client TLS settings applied to every handshake made by a dialer.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub min_version: Option<SslVersion>,
    pub max_version: Option<SslVersion>,
    pub alpn_protos: Vec<String>,
    pub handshake_timeout: Duration,
    /// Verify the peer certificate chain and host name.
    pub verify_peer: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::dns()
    }
}

impl TlsConfig {
    /// DNS-over-TLS: no ALPN.
    pub fn dns() -> Self {
        Self {
            min_version: Some(SslVersion::TLS1_2),
            max_version: Some(SslVersion::TLS1_3),
            alpn_protos: Vec::new(),
            handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
            verify_peer: true,
        }
    }

    /// DNS-over-HTTPS: offers h2 first, then http/1.1.
    pub fn https() -> Self {
        Self {
            alpn_protos: vec!["h2".to_string(), "http/1.1".to_string()],
            ..Self::dns()
        }
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    /// Apply this configuration to an SSL connector builder.
    pub fn apply_to_builder(&self, builder: &mut SslConnectorBuilder) -> Result<(), NetError> {
        if let Some(min) = self.min_version {
            builder.set_min_proto_version(Some(min)).map_err(|_| NetError::SslProtocolError)?;
        }
        if let Some(max) = self.max_version {
            builder.set_max_proto_version(Some(max)).map_err(|_| NetError::SslProtocolError)?;
        }

        if !self.alpn_protos.is_empty() {
            let alpn_wire = encode_alpn(&self.alpn_protos)?;
            builder.set_alpn_protos(&alpn_wire).map_err(|_| NetError::SslProtocolError)?;
        }

        builder.set_verify(if self.verify_peer {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        });

        Ok(())
    }

    /// Check if SNI (Server Name Indication) should be set for this host.
    /// Per RFC 6066, SNI MUST NOT be set for raw IP addresses.
    pub fn should_set_sni(host: &str) -> bool {
        host.parse::<std::net::IpAddr>().is_err()
    }
}

/// Length-prefixed ALPN wire encoding.
pub fn encode_alpn(protos: &[String]) -> Result<Vec<u8>, NetError> {
    let mut wire = Vec::new();
    for proto in protos {
        let len = u8::try_from(proto.len()).map_err(|_| NetError::SslProtocolError)?;
        if len == 0 {
            return Err(NetError::SslProtocolError);
        }
        wire.push(len);
        wire.extend_from_slice(proto.as_bytes());
    }
    Ok(wire)
}

/// Run a client handshake over `socket`, bound to `host`.
///
/// Returns the wrapped socket and whether the peer selected `h2`.
pub async fn connect(
    config: &TlsConfig,
    host: &str,
    socket: BoxedSocket,
) -> Result<(BoxedSocket, bool), NetError> {
    let mut builder =
        SslConnector::builder(SslMethod::tls()).map_err(|_| NetError::SslProtocolError)?;
    config.apply_to_builder(&mut builder)?;

    let connector = builder.build();
    let mut ssl = connector.configure().map_err(|_| NetError::SslProtocolError)?;
    ssl.set_use_server_name_indication(TlsConfig::should_set_sni(host));
    ssl.set_verify_hostname(config.verify_peer);

    let handshake = tokio_boring::connect(ssl, host, socket);
    let stream = match tokio::time::timeout(config.handshake_timeout, handshake).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!(host = %host, error = ?e, "TLS handshake failed");
            return Err(NetError::SslProtocolError);
        }
        Err(_) => {
            tracing::debug!(
                host = %host,
                timeout = ?config.handshake_timeout,
                "TLS handshake timed out"
            );
            return Err(NetError::ConnectionTimedOut);
        }
    };

    let is_h2 = stream.ssl().selected_alpn_protocol() == Some(b"h2".as_slice());
    tracing::debug!(host = %host, h2 = is_h2, "TLS established");
    Ok((BoxedSocket::new(stream), is_h2))
}

/// Wraps another dialer's sockets in TLS bound to the destination host.
#[derive(Clone)]
pub struct TlsDialer {
    inner: Arc<dyn Dial>,
    config: TlsConfig,
}

impl TlsDialer {
    pub fn new(inner: Arc<dyn Dial>, config: TlsConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

impl Dial for TlsDialer {
    fn dial(&self, destination: &Destination) -> Dialing {
        let raw = self.inner.dial(destination);
        let config = self.config.clone();
        let host = destination.address.host();

        Box::pin(async move {
            let socket = raw.await?;
            let (tls, _) = connect(&config, &host, socket).await?;
            Ok(tls)
        })
    }
}
