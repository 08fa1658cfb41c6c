use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Network error registry.
///
/// Plain variants carry stable negative codes (see [`NetError::as_i32`]) so
/// they can cross process or FFI boundaries. Context variants wrap the
/// originating `io::Error` in an `Arc` so the whole enum stays `Clone`;
/// a failed dial is handed to every caller that waited on it.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Message too big")]
    MsgTooBig,
    #[error("Address in use")]
    AddressInUse,
    #[error("Operation not supported")]
    NotSupported,
    #[error("Broken pipe")]
    ClosedPipe,

    // Message / packet errors
    #[error("Invalid DNS message")]
    InvalidMessage,
    #[error("Invalid echo packet")]
    InvalidPacket,
    #[error("IPv6 ping is disabled")]
    Ipv6PingDisabled,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Invalid response")]
    InvalidResponse,
    #[error("HTTP/2 protocol error")]
    Http2ProtocolError,
    #[error("DoH server returned code {0}")]
    HttpStatus(u16),

    // Errors with context
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Name {domain} not resolved: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Failed to listen on {addr}: {source}")]
    ListenFailed {
        addr: IpAddr,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Socket I/O error: {0}")]
    SocketIo(#[source] Arc<io::Error>),

    #[error("Unknown ping protocol: {0}")]
    UnknownPingProtocol(String),

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed | NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolved | NetError::NameNotResolvedFor { .. } => -105,
            NetError::SslProtocolError => -107,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::ConnectionTimedOut => -118,
            NetError::MsgTooBig => -142,
            NetError::AddressInUse => -147,
            NetError::NotSupported => -11,
            NetError::ClosedPipe => -13,

            NetError::InvalidUrl => -300,
            NetError::InvalidResponse => -320,
            NetError::Http2ProtocolError => -337,
            NetError::HttpStatus(_) => -370,

            // Codes below -10000 are local to this crate.
            NetError::InvalidMessage => -10001,
            NetError::InvalidPacket => -10002,
            NetError::Ipv6PingDisabled => -10003,
            NetError::ListenFailed { .. } => -10004,
            NetError::SocketIo(_) => -10005,
            NetError::UnknownPingProtocol(_) => -10006,
            NetError::Unknown(code) => *code,
        }
    }

    pub(crate) fn connection_failed_to(host: &str, port: u16, source: io::Error) -> Self {
        NetError::ConnectionFailedTo {
            host: host.to_string(),
            port,
            source: Arc::new(source),
        }
    }

    pub(crate) fn dns_failed(domain: &str, source: io::Error) -> Self {
        NetError::NameNotResolvedFor {
            domain: domain.to_string(),
            source: Arc::new(source),
        }
    }

    /// True for errors that mean the underlying handle has been torn down.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            NetError::ClosedPipe | NetError::ConnectionClosed | NetError::ConnectionReset
        )
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -107 => NetError::SslProtocolError,
            -108 => NetError::AddressInvalid,
            -109 => NetError::AddressUnreachable,
            -118 => NetError::ConnectionTimedOut,
            -142 => NetError::MsgTooBig,
            -147 => NetError::AddressInUse,
            -11 => NetError::NotSupported,
            -13 => NetError::ClosedPipe,

            -300 => NetError::InvalidUrl,
            -320 => NetError::InvalidResponse,
            -337 => NetError::Http2ProtocolError,

            -10001 => NetError::InvalidMessage,
            -10002 => NetError::InvalidPacket,
            -10003 => NetError::Ipv6PingDisabled,
            _ => NetError::Unknown(code),
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => NetError::ClosedPipe,
            io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
            io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
            io::ErrorKind::AddrInUse => NetError::AddressInUse,
            io::ErrorKind::AddrNotAvailable => NetError::AddressInvalid,
            _ => NetError::SocketIo(Arc::new(err)),
        }
    }
}
