//! Socket abstraction for polymorphic socket handling.
//!
//! This module provides a `StreamSocket` trait that allows uniform handling of
//! the sockets a dialer can hand back: plain TCP, TLS over anything, connected
//! UDP, and in-memory pipes used by tests or in-process links.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_boring::SslStream;

/// A trait for any socket that supports async read/write operations.
/// Enables TLS wrapping of any socket type.
pub trait StreamSocket: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static {
    /// Check if the socket is connected.
    fn is_connected(&self) -> bool {
        true
    }

    /// Whether each read returns exactly one peer message.
    fn is_datagram(&self) -> bool {
        false
    }
}

impl StreamSocket for TcpStream {}

impl<S: StreamSocket> StreamSocket for SslStream<S> {}

impl StreamSocket for DuplexStream {}

/// A connected UDP socket exposed through the stream traits.
///
/// Every write sends one datagram and every read receives one, so message
/// boundaries survive as long as the reader's buffer is large enough.
#[derive(Debug)]
pub struct DatagramSocket {
    inner: UdpSocket,
}

impl DatagramSocket {
    /// Wrap a socket that has already been `connect`ed to its peer.
    pub fn new(inner: UdpSocket) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &UdpSocket {
        &self.inner
    }
}

impl AsyncRead for DatagramSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.poll_recv(cx, buf)
    }
}

impl AsyncWrite for DatagramSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl StreamSocket for DatagramSocket {
    fn is_datagram(&self) -> bool {
        true
    }
}

/// A wrapper type for boxed dynamic StreamSocket that is object-safe.
/// This avoids conflicting trait implementations with tokio's blanket impls.
pub struct BoxedSocket {
    inner: Pin<Box<dyn StreamSocket>>,
    datagram: bool,
}

impl BoxedSocket {
    /// Create a new BoxedSocket from any StreamSocket.
    pub fn new<S: StreamSocket>(socket: S) -> Self {
        let datagram = socket.is_datagram();
        Self {
            inner: Box::pin(socket),
            datagram,
        }
    }

    /// Get a pinned mutable reference to the inner socket.
    pub fn as_mut(&mut self) -> Pin<&mut dyn StreamSocket> {
        self.inner.as_mut()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn is_datagram(&self) -> bool {
        self.datagram
    }
}

impl std::fmt::Debug for BoxedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxedSocket").field("datagram", &self.datagram).finish_non_exhaustive()
    }
}

impl AsyncRead for BoxedSocket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for BoxedSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_shutdown(cx)
    }
}

impl StreamSocket for BoxedSocket {
    fn is_connected(&self) -> bool {
        BoxedSocket::is_connected(self)
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }
}
