//! Per-destination echo state: sequence allocation and the pending-reply
//! registry.

use crate::base::destination::{Destination, IpFamily};
use crate::base::timer::ActivityTimer;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Idle time after which an echo client expires.
pub const ECHO_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending entries older than this are pruned once the registry is large.
pub const PENDING_ECHO_MAX_AGE: Duration = Duration::from_secs(30);

/// Registry size at which registration starts pruning stale entries.
pub const PENDING_ECHO_SOFT_LIMIT: usize = 256;

/// Wrapping 16-bit counter that never yields 0.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU16);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u16 {
        let step = |current: u16| match current.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        // The closure always returns Some, so both arms carry the previous value.
        let previous = match self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(step(c)))
        {
            Ok(previous) | Err(previous) => previous,
        };
        step(previous)
    }
}

/// A reply handed to the virtual connection that sent the request.
#[derive(Debug)]
pub(crate) struct EchoReply {
    pub packet: Bytes,
    pub ident: u16,
    pub sequence: u16,
}

/// A request waiting for its reply.
#[derive(Debug)]
pub(crate) struct PendingEcho {
    reply_to: mpsc::Sender<EchoReply>,
    ident: u16,
    sequence: u16,
    registered_at: Instant,
}

impl PendingEcho {
    pub fn new(reply_to: mpsc::Sender<EchoReply>, ident: u16, sequence: u16) -> Self {
        Self {
            reply_to,
            ident,
            sequence,
            registered_at: Instant::now(),
        }
    }

    /// Offer the reply without blocking. Returns false when the slot is
    /// occupied or the connection is gone.
    pub fn deliver(self, packet: Bytes) -> bool {
        self.reply_to
            .try_send(EchoReply {
                packet,
                ident: self.ident,
                sequence: self.sequence,
            })
            .is_ok()
    }

    fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }
}

/// Correlation state for one echo destination, shared by every virtual
/// connection to that address.
pub struct EchoClient {
    destination: Destination,
    remote: IpAddr,
    key: String,
    id: u16,
    sequence: SequenceCounter,
    pending: DashMap<u16, PendingEcho>,
    timer: ActivityTimer,
    scope: CancellationToken,
}

impl EchoClient {
    /// Build a client whose idle timer calls `on_idle` with a handle to the
    /// client itself before cancelling its scope.
    pub(crate) fn spawn<F>(
        destination: Destination,
        remote: IpAddr,
        id: u16,
        parent: &CancellationToken,
        on_idle: F,
    ) -> Arc<Self>
    where
        F: FnOnce(&str, &Weak<EchoClient>) + Send + 'static,
    {
        let key = destination.address_key();
        Arc::new_cyclic(|this: &Weak<EchoClient>| {
            let scope = parent.child_token();
            let this = this.clone();
            let idle_key = key.clone();
            let timer = ActivityTimer::cancel_after_inactivity(
                scope.clone(),
                ECHO_CLIENT_IDLE_TIMEOUT,
                move || {
                    tracing::debug!(destination = %idle_key, "echo client idle, expiring");
                    on_idle(&idle_key, &this);
                },
            );

            Self {
                destination,
                remote,
                key,
                id,
                sequence: SequenceCounter::new(),
                pending: DashMap::new(),
                timer,
                scope,
            }
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn remote(&self) -> IpAddr {
        self.remote
    }

    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.remote)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Manager-assigned identifier.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn next_sequence(&self) -> u16 {
        self.sequence.next()
    }

    pub fn touch(&self) {
        self.timer.update();
    }

    pub fn is_live(&self) -> bool {
        !self.scope.is_cancelled()
    }

    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn close(&self) {
        self.scope.cancel();
    }

    pub(crate) fn register(&self, sequence: u16, pending: PendingEcho) {
        if self.pending.len() >= PENDING_ECHO_SOFT_LIMIT {
            let before = self.pending.len();
            self.pending.retain(|_, entry| entry.age() < PENDING_ECHO_MAX_AGE);
            tracing::trace!(
                destination = %self.key,
                pruned = before - self.pending.len(),
                "pruned stale echo requests"
            );
        }
        self.pending.insert(sequence, pending);
    }

    /// Remove and return the entry for `sequence`. At most one caller gets it.
    pub(crate) fn take(&self, sequence: u16) -> Option<PendingEcho> {
        self.pending.remove(&sequence).map(|(_, pending)| pending)
    }
}

impl std::fmt::Debug for EchoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoClient")
            .field("remote", &self.remote)
            .field("id", &self.id)
            .field("pending", &self.pending.len())
            .field("live", &self.is_live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(parent: &CancellationToken) -> Arc<EchoClient> {
        let dest: Destination = "udp:192.0.2.1:7".parse().unwrap();
        let remote = dest.address.ip().unwrap();
        EchoClient::spawn(dest, remote, 1, parent, |_, _| {})
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
    }

    #[test]
    fn test_sequence_skips_zero_on_wrap() {
        let counter = SequenceCounter::new();
        for _ in 0..65535 {
            counter.next();
        }
        // 65535 allocations end on u16::MAX; the next one wraps past 0.
        assert_eq!(counter.next(), 1);
    }

    #[tokio::test]
    async fn test_take_consumes_once() {
        let parent = CancellationToken::new();
        let client = client(&parent);
        let (tx, mut rx) = mpsc::channel(1);

        client.register(5, PendingEcho::new(tx, 0xabcd, 9));
        let pending = client.take(5).unwrap();
        assert!(client.take(5).is_none());

        assert!(pending.deliver(Bytes::from_static(b"reply")));
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.ident, 0xabcd);
        assert_eq!(reply.sequence, 9);
        assert_eq!(&reply.packet[..], b"reply");
    }

    #[tokio::test]
    async fn test_deliver_drops_when_slot_full() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(PendingEcho::new(tx.clone(), 1, 1).deliver(Bytes::new()));
        assert!(!PendingEcho::new(tx, 1, 2).deliver(Bytes::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_prunes_stale_entries() {
        let parent = CancellationToken::new();
        let client = client(&parent);
        let (tx, _rx) = mpsc::channel(1);

        for seq in 0..PENDING_ECHO_SOFT_LIMIT as u16 {
            client.register(seq, PendingEcho::new(tx.clone(), 0, seq));
        }
        tokio::time::advance(PENDING_ECHO_MAX_AGE).await;

        client.register(1000, PendingEcho::new(tx, 0, 1000));
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_client() {
        let parent = CancellationToken::new();
        let client = client(&parent);
        assert!(client.is_live());
        parent.cancel();
        assert!(!client.is_live());
    }
}
