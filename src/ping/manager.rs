//! Raw echo multiplexer.
//!
//! One shared ICMP socket per address family carries every echo flow. Each
//! socket is opened lazily on the first dial for its family and read by a
//! single background loop, which routes replies to the [`EchoClient`] of the
//! source address and from there to the flow that sent the request.

use crate::base::destination::{Destination, IpFamily};
use crate::base::neterror::NetError;
use crate::ping::client::EchoClient;
use crate::ping::config::PingConfig;
use crate::ping::conn::VirtualEchoConnection;
use crate::ping::packet::{is_echo_reply, ECHO_HEADER_LEN};
use crate::ping::socket::{IcmpListener, PacketConn, PacketListener};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

const MAX_PACKET_SIZE: usize = 65535;

struct FamilySocket {
    conn: Arc<dyn PacketConn>,
    shutdown: CancellationToken,
    generation: u64,
}

pub(crate) struct ManagerInner {
    config: PingConfig,
    listener: Arc<dyn PacketListener>,
    v4: Mutex<Option<FamilySocket>>,
    v6: Mutex<Option<FamilySocket>>,
    clients: DashMap<String, Arc<EchoClient>>,
    next_id: AtomicU16,
    generation: AtomicU64,
    scope: CancellationToken,
}

impl ManagerInner {
    fn family_slot(&self, family: IpFamily) -> &Mutex<Option<FamilySocket>> {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }

    /// Return the family's socket, opening it and starting its reader on
    /// first use.
    pub(crate) fn ensure_socket(
        self: &Arc<Self>,
        family: IpFamily,
    ) -> Result<Arc<dyn PacketConn>, NetError> {
        if self.scope.is_cancelled() {
            return Err(NetError::ClosedPipe);
        }

        let mut slot = self.family_slot(family).lock();
        if let Some(active) = slot.as_ref() {
            return Ok(Arc::clone(&active.conn));
        }

        let conn = self.listener.listen(family)?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let shutdown = self.scope.child_token();
        tokio::spawn(read_loop(
            Arc::downgrade(self),
            Arc::clone(&conn),
            family,
            generation,
            shutdown.clone(),
        ));
        tracing::debug!(?family, "echo socket active");

        *slot = Some(FamilySocket {
            conn: Arc::clone(&conn),
            shutdown,
            generation,
        });
        Ok(conn)
    }

    /// The family's open socket. Never reopens one; after a fatal read error
    /// only a fresh dial does.
    pub(crate) fn active_socket(&self, family: IpFamily) -> Result<Arc<dyn PacketConn>, NetError> {
        if self.scope.is_cancelled() {
            return Err(NetError::ClosedPipe);
        }
        self.family_slot(family)
            .lock()
            .as_ref()
            .map(|active| Arc::clone(&active.conn))
            .ok_or(NetError::ClosedPipe)
    }

    /// Release the family's socket. With `generation` set, only that
    /// incarnation is closed; a newer socket is left alone.
    fn close_family(&self, family: IpFamily, generation: Option<u64>) {
        let mut slot = self.family_slot(family).lock();
        let matches = match (slot.as_ref(), generation) {
            (Some(active), Some(generation)) => active.generation == generation,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            if let Some(active) = slot.take() {
                active.shutdown.cancel();
                tracing::debug!(?family, "echo socket closed");
            }
        }
    }

    fn get_or_create_client(
        self: &Arc<Self>,
        destination: &Destination,
        remote: IpAddr,
    ) -> Arc<EchoClient> {
        let key = destination.address_key();
        match self.clients.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    return Arc::clone(occupied.get());
                }
                let client = self.new_client(destination, remote);
                occupied.insert(Arc::clone(&client));
                client
            }
            Entry::Vacant(vacant) => {
                let client = self.new_client(destination, remote);
                vacant.insert(Arc::clone(&client));
                client
            }
        }
    }

    fn new_client(self: &Arc<Self>, destination: &Destination, remote: IpAddr) -> Arc<EchoClient> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let manager = Arc::downgrade(self);
        tracing::debug!(destination = %remote, id, "new echo client");
        EchoClient::spawn(destination.clone(), remote, id, &self.scope, move |key, client| {
            if let Some(manager) = manager.upgrade() {
                manager.remove_client(key, client);
            }
        })
    }

    /// Drop the registry entry for `key` if it still points at `client`.
    fn remove_client(&self, key: &str, client: &Weak<EchoClient>) {
        self.clients.remove_if(key, |_, current| {
            std::ptr::eq(Arc::as_ptr(current), client.as_ptr())
        });
    }

    fn dispatch(&self, family: IpFamily, packet: &[u8], from: IpAddr) {
        if packet.len() < ECHO_HEADER_LEN || !is_echo_reply(family, packet[0]) {
            return;
        }

        let Some(client) = self
            .clients
            .get(&from.to_string())
            .map(|entry| Arc::clone(entry.value()))
        else {
            tracing::trace!(source = %from, "echo reply from unknown source");
            return;
        };

        let sequence = u16::from_be_bytes([packet[6], packet[7]]);
        match client.take(sequence) {
            Some(pending) => {
                if !pending.deliver(Bytes::copy_from_slice(packet)) {
                    tracing::trace!(
                        source = %from,
                        sequence,
                        "reply slot occupied, dropping echo reply"
                    );
                }
            }
            None => tracing::trace!(source = %from, sequence, "uncorrelated echo reply"),
        }
    }
}

async fn read_loop(
    manager: Weak<ManagerInner>,
    conn: Arc<dyn PacketConn>,
    family: IpFamily,
    generation: u64,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = conn.recv_from(&mut buf) => received,
        };

        let Some(manager) = manager.upgrade() else { break };
        match received {
            Ok((n, from)) => manager.dispatch(family, &buf[..n], from),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Err(e) => {
                tracing::warn!(?family, error = %e, "failed to read echo socket");
                manager.close_family(family, Some(generation));
                break;
            }
        }
    }
}

/// Multiplexes echo flows over one shared ICMP socket per address family.
#[derive(Clone)]
pub struct PingManager {
    inner: Arc<ManagerInner>,
}

impl PingManager {
    pub fn new(config: PingConfig) -> Self {
        let listener = Arc::new(IcmpListener::new(config.clone()));
        Self::with_listener(config, listener)
    }

    /// Use a custom socket source.
    pub fn with_listener(config: PingConfig, listener: Arc<dyn PacketListener>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                listener,
                v4: Mutex::new(None),
                v6: Mutex::new(None),
                clients: DashMap::new(),
                next_id: AtomicU16::new(1),
                generation: AtomicU64::new(1),
                scope: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &PingConfig {
        &self.inner.config
    }

    /// Open a new echo flow to `destination`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dial(&self, destination: &Destination) -> Result<VirtualEchoConnection, NetError> {
        let remote = destination.address.ip().ok_or(NetError::AddressInvalid)?;
        let family = IpFamily::of(&remote);
        if family == IpFamily::V6 && self.inner.config.disable_ipv6 {
            return Err(NetError::Ipv6PingDisabled);
        }

        self.inner.ensure_socket(family)?;
        let client = self.inner.get_or_create_client(destination, remote);
        Ok(VirtualEchoConnection::new(
            &client,
            Arc::downgrade(&self.inner),
            self.inner.config.protocol.is_privileged(),
        ))
    }

    /// Close both sockets and expire every client. Later dials fail with
    /// `ClosedPipe`.
    pub fn close(&self) {
        self.inner.scope.cancel();
        self.inner.close_family(IpFamily::V4, None);
        self.inner.close_family(IpFamily::V6, None);
        self.inner.clients.retain(|_, client| {
            client.close();
            false
        });
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_socket_active(&self, family: IpFamily) -> bool {
        self.inner.family_slot(family).lock().is_some()
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

impl std::fmt::Debug for PingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingManager")
            .field("config", &self.inner.config)
            .field("clients", &self.client_count())
            .field("v4", &self.is_socket_active(IpFamily::V4))
            .field("v6", &self.is_socket_active(IpFamily::V6))
            .finish()
    }
}
