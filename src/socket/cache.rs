//! Dispatched-connection cache.
//!
//! Holds at most one live outbound connection per destination. Connections
//! are dialed lazily on first use, shared by every caller writing to the same
//! destination, and discarded once idle or broken. A background reader per
//! connection hands each inbound unit to the cache's [`WriteBack`].

use crate::base::destination::Destination;
use crate::base::neterror::NetError;
use crate::base::timer::ActivityTimer;
use crate::socket::connectjob::Dial;
use crate::socket::stream::BoxedSocket;
use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Idle time after which a cached connection is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_DATAGRAM_SIZE: usize = 65535;

/// Sink for inbound units read from a cached connection.
pub type WriteBack = Arc<dyn Fn(Bytes) + Send + Sync>;

/// How the background reader splits the inbound byte stream into units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFraming {
    /// Every read is one unit.
    Datagram,
    /// RFC 7766 2-byte length prefix; the prefix is stripped.
    LengthPrefixed,
}

type Entries = Arc<Mutex<HashMap<String, Slot>>>;
type PendingDial = Shared<BoxFuture<'static, Result<Arc<CachedConnection>, NetError>>>;

enum Slot {
    Ready(Arc<CachedConnection>),
    Dialing { id: u64, dial: PendingDial },
}

/// Everything a dial needs, detached from the cache so an in-flight dial
/// does not keep the cache alive.
#[derive(Clone)]
struct DialContext {
    dialer: Arc<dyn Dial>,
    write_back: WriteBack,
    framing: InboundFraming,
    idle_timeout: Duration,
    scope: CancellationToken,
    entries: Weak<Mutex<HashMap<String, Slot>>>,
}

struct CacheInner {
    ctx: DialContext,
    entries: Entries,
    next_dial_id: AtomicU64,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.ctx.scope.cancel();
    }
}

/// Lazily dialed, destination-keyed connection cache.
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for ConnectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCache")
            .field("framing", &self.inner.ctx.framing)
            .field("idle_timeout", &self.inner.ctx.idle_timeout)
            .field("live", &self.live_count())
            .finish()
    }
}

impl ConnectionCache {
    pub fn new(dialer: Arc<dyn Dial>, framing: InboundFraming, write_back: WriteBack) -> Self {
        Self::with_idle_timeout(dialer, framing, write_back, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        dialer: Arc<dyn Dial>,
        framing: InboundFraming,
        write_back: WriteBack,
        idle_timeout: Duration,
    ) -> Self {
        let entries: Entries = Arc::new(Mutex::new(HashMap::new()));
        let ctx = DialContext {
            dialer,
            write_back,
            framing,
            idle_timeout,
            scope: CancellationToken::new(),
            entries: Arc::downgrade(&entries),
        };
        Self {
            inner: Arc::new(CacheInner {
                ctx,
                entries,
                next_dial_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn framing(&self) -> InboundFraming {
        self.inner.ctx.framing
    }

    /// Return the live connection for `destination`, dialing one if needed.
    ///
    /// Concurrent callers for the same destination share a single dial and
    /// all observe its outcome, including failure.
    pub async fn acquire(
        &self,
        destination: &Destination,
    ) -> Result<Arc<CachedConnection>, NetError> {
        if self.inner.ctx.scope.is_cancelled() {
            return Err(NetError::ClosedPipe);
        }

        let key = destination.key();
        let (id, dial) = {
            let mut entries = self.inner.entries.lock();
            match entries.get(&key) {
                Some(Slot::Ready(conn)) if conn.is_live() => return Ok(Arc::clone(conn)),
                Some(Slot::Dialing { id, dial }) => (*id, dial.clone()),
                _ => {
                    let id = self.inner.next_dial_id.fetch_add(1, Ordering::Relaxed);
                    let dial = establish(self.inner.ctx.clone(), destination.clone())
                        .boxed()
                        .shared();
                    entries.insert(key.clone(), Slot::Dialing {
                        id,
                        dial: dial.clone(),
                    });
                    (id, dial)
                }
            }
        };

        let result = dial.await;

        let mut entries = self.inner.entries.lock();
        if matches!(entries.get(&key), Some(Slot::Dialing { id: current, .. }) if *current == id) {
            match &result {
                Ok(conn) => {
                    entries.insert(key, Slot::Ready(Arc::clone(conn)));
                }
                Err(e) => {
                    tracing::debug!(destination = %destination, error = %e, "dial failed");
                    entries.remove(&key);
                }
            }
        }
        result
    }

    /// Acquire the connection for `destination` and write `bytes` to it.
    pub async fn write(&self, destination: &Destination, bytes: &[u8]) -> Result<(), NetError> {
        let conn = self.acquire(destination).await?;
        conn.write(bytes).await
    }

    /// Number of entries currently holding a live connection.
    pub fn live_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(conn) if conn.is_live()))
            .count()
    }

    /// Close every connection. Later calls to `acquire` fail with `ClosedPipe`.
    pub fn close(&self) {
        self.inner.ctx.scope.cancel();
        self.inner.entries.lock().clear();
    }
}

/// One cached outbound connection.
pub struct CachedConnection {
    destination: Destination,
    scope: CancellationToken,
    timer: ActivityTimer,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedSocket>>>,
}

impl CachedConnection {
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_live(&self) -> bool {
        !self.scope.is_cancelled()
    }

    /// Write one outbound unit. An I/O failure invalidates the connection.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), NetError> {
        if self.scope.is_cancelled() {
            return Err(NetError::ClosedPipe);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetError::ClosedPipe)?;

        let written = match writer.write_all(bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };

        match written {
            Ok(()) => {
                self.timer.update();
                Ok(())
            }
            Err(e) => {
                tracing::debug!(
                    destination = %self.destination,
                    error = %e,
                    "write failed, dropping connection"
                );
                guard.take();
                self.scope.cancel();
                Err(e.into())
            }
        }
    }

    pub fn close(&self) {
        self.scope.cancel();
    }
}

impl std::fmt::Debug for CachedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedConnection")
            .field("destination", &self.destination)
            .field("live", &self.is_live())
            .field("timer", &self.timer)
            .finish()
    }
}

enum Inbound {
    Datagram {
        reader: ReadHalf<BoxedSocket>,
        buf: Box<[u8]>,
        datagram_socket: bool,
    },
    Framed(FramedRead<ReadHalf<BoxedSocket>, LengthDelimitedCodec>),
}

impl Inbound {
    fn new(reader: ReadHalf<BoxedSocket>, framing: InboundFraming, datagram_socket: bool) -> Self {
        match framing {
            InboundFraming::Datagram => Inbound::Datagram {
                reader,
                buf: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
                datagram_socket,
            },
            InboundFraming::LengthPrefixed => {
                let codec = LengthDelimitedCodec::builder()
                    .length_field_length(2)
                    .max_frame_length(u16::MAX as usize)
                    .new_codec();
                Inbound::Framed(FramedRead::new(reader, codec))
            }
        }
    }

    /// Next inbound unit, or `None` once the peer has closed the stream.
    async fn next(&mut self) -> Option<io::Result<Bytes>> {
        match self {
            Inbound::Datagram {
                reader,
                buf,
                datagram_socket,
            } => loop {
                match reader.read(buf).await {
                    // Empty datagrams are legal; EOF only exists on streams.
                    Ok(0) if *datagram_socket => continue,
                    Ok(0) => return None,
                    Ok(n) => return Some(Ok(Bytes::copy_from_slice(&buf[..n]))),
                    Err(e) => return Some(Err(e)),
                }
            },
            Inbound::Framed(framed) => framed.next().await.map(|frame| frame.map(BytesMut::freeze)),
        }
    }
}

async fn establish(
    ctx: DialContext,
    destination: Destination,
) -> Result<Arc<CachedConnection>, NetError> {
    tracing::debug!(destination = %destination, "establishing new connection");
    let socket = ctx.dialer.dial(&destination).await?;
    let datagram_socket = socket.is_datagram();
    let (reader, writer) = tokio::io::split(socket);

    let scope = ctx.scope.child_token();
    let idle_destination = destination.clone();
    let timer = ActivityTimer::cancel_after_inactivity(scope.clone(), ctx.idle_timeout, move || {
        tracing::debug!(destination = %idle_destination, "connection idle, closing");
    });

    let conn = Arc::new(CachedConnection {
        destination,
        scope,
        timer,
        writer: tokio::sync::Mutex::new(Some(writer)),
    });

    let inbound = Inbound::new(reader, ctx.framing, datagram_socket);
    tokio::spawn(read_loop(Arc::clone(&conn), inbound, ctx.write_back, ctx.entries));

    Ok(conn)
}

async fn read_loop(
    conn: Arc<CachedConnection>,
    mut inbound: Inbound,
    write_back: WriteBack,
    entries: Weak<Mutex<HashMap<String, Slot>>>,
) {
    loop {
        let unit = tokio::select! {
            _ = conn.scope.cancelled() => break,
            unit = inbound.next() => unit,
        };

        match unit {
            Some(Ok(bytes)) => {
                conn.timer.update();
                write_back(bytes);
            }
            Some(Err(e)) => {
                tracing::debug!(
                    destination = %conn.destination,
                    error = %e,
                    "failed to read inbound"
                );
                break;
            }
            None => {
                tracing::debug!(destination = %conn.destination, "connection closed by peer");
                break;
            }
        }
    }

    conn.scope.cancel();
    if let Some(mut writer) = conn.writer.lock().await.take() {
        let _ = writer.shutdown().await;
    }

    if let Some(entries) = entries.upgrade() {
        let key = conn.destination.key();
        let mut entries = entries.lock();
        if matches!(entries.get(&key), Some(Slot::Ready(current)) if Arc::ptr_eq(current, &conn)) {
            entries.remove(&key);
        }
    }
}
