//! Echo multiplexer tests over an in-memory packet network.

use muxnet::base::destination::{Destination, IpFamily};
use muxnet::base::neterror::NetError;
use muxnet::ping::client::ECHO_CLIENT_IDLE_TIMEOUT;
use muxnet::ping::packet::{
    internet_checksum, EchoPacket, ICMPV4_ECHO_REPLY, ICMPV4_ECHO_REQUEST, ICMPV6_ECHO_REPLY,
    ICMPV6_ECHO_REQUEST,
};
use muxnet::ping::{PacketConn, PacketListener, PingConfig, PingManager, PingProtocol};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Datagram = (Vec<u8>, IpAddr);

struct MemoryConn {
    sent: mpsc::UnboundedSender<Datagram>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl PacketConn for MemoryConn {
    fn send_to<'a>(&'a self, packet: &'a [u8], target: IpAddr) -> BoxFuture<'a, io::Result<usize>> {
        Box::pin(async move {
            self.sent
                .send((packet.to_vec(), target))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(packet.len())
        })
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, IpAddr)>> {
        Box::pin(async move {
            match self.inbound.lock().await.recv().await {
                Some((packet, from)) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok((packet.len(), from))
                }
                None => Err(io::Error::other("network down")),
            }
        })
    }
}

/// Opens in-memory sockets and keeps the test's ends of them.
struct MemoryListener {
    listens: AtomicUsize,
    sent: mpsc::UnboundedSender<Datagram>,
    v4: Mutex<Option<mpsc::UnboundedSender<Datagram>>>,
    v6: Mutex<Option<mpsc::UnboundedSender<Datagram>>>,
}

impl MemoryListener {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Datagram>) {
        let (sent, wire) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            listens: AtomicUsize::new(0),
            sent,
            v4: Mutex::new(None),
            v6: Mutex::new(None),
        });
        (listener, wire)
    }

    fn slot(&self, family: IpFamily) -> &Mutex<Option<mpsc::UnboundedSender<Datagram>>> {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }

    fn inject(&self, packet: Vec<u8>, from: IpAddr) {
        let slot = self.slot(IpFamily::of(&from)).lock();
        slot.as_ref().expect("socket not open").send((packet, from)).unwrap();
    }

    /// Make the family's socket fail its next read.
    fn break_socket(&self, family: IpFamily) {
        self.slot(family).lock().take();
    }

    fn listens(&self) -> usize {
        self.listens.load(Ordering::SeqCst)
    }
}

impl PacketListener for MemoryListener {
    fn listen(&self, family: IpFamily) -> Result<Arc<dyn PacketConn>, NetError> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        let (inject, inbound) = mpsc::unbounded_channel();
        *self.slot(family).lock() = Some(inject);
        Ok(Arc::new(MemoryConn {
            sent: self.sent.clone(),
            inbound: tokio::sync::Mutex::new(inbound),
        }))
    }
}

fn echo_request(icmp_type: u8, ident: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![icmp_type, 0, 0, 0, 0, 0, 0, 0];
    buf.extend_from_slice(payload);
    let mut packet = EchoPacket::new(&mut buf).unwrap();
    packet.set_ident(ident);
    packet.set_sequence(sequence);
    packet.update_checksum();
    buf
}

/// What a remote host sends back for `request`.
fn echo_reply(request: &[u8]) -> Vec<u8> {
    let mut buf = request.to_vec();
    let mut packet = EchoPacket::new(&mut buf).unwrap();
    match packet.icmp_type() {
        ICMPV6_ECHO_REQUEST => packet.set_icmp_type(ICMPV6_ECHO_REPLY),
        _ => {
            packet.set_icmp_type(ICMPV4_ECHO_REPLY);
            packet.update_checksum();
        }
    }
    buf
}

fn sequence_of(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[6], packet[7]])
}

fn ident_of(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[4], packet[5]])
}

fn manager(
    protocol: PingProtocol,
) -> (PingManager, Arc<MemoryListener>, mpsc::UnboundedReceiver<Datagram>) {
    let (listener, wire) = MemoryListener::new();
    let manager = PingManager::with_listener(
        PingConfig::default().with_protocol(protocol),
        listener.clone(),
    );
    (manager, listener, wire)
}

const V4_TARGET: &str = "udp:192.0.2.9:7";
const V6_TARGET: &str = "udp:[2001:db8::9]:7";

async fn read_reply(conn: &muxnet::ping::VirtualEchoConnection) -> Vec<u8> {
    let mut buf = [0u8; 1500];
    let n = tokio::time::timeout(Duration::from_secs(1), conn.read(&mut buf))
        .await
        .expect("no reply delivered")
        .unwrap();
    buf[..n].to_vec()
}

#[tokio::test]
async fn test_v4_round_trip_restores_ident_and_sequence() {
    let (manager, listener, mut wire) = manager(PingProtocol::Default);
    let dest: Destination = V4_TARGET.parse().unwrap();
    let conn = manager.dial(&dest).unwrap();

    let request = echo_request(ICMPV4_ECHO_REQUEST, 0x4242, 7, b"ping payload");
    assert_eq!(conn.write(&request).await.unwrap(), request.len());

    let (sent, target) = wire.recv().await.unwrap();
    assert_eq!(target, dest.address.ip().unwrap());
    assert_eq!(ident_of(&sent), 0);
    assert_eq!(sequence_of(&sent), 1);
    assert_eq!(internet_checksum(&sent), 0, "privileged v4 checksum must be recomputed");

    listener.inject(echo_reply(&sent), target);
    let reply = read_reply(&conn).await;

    assert_eq!(reply[0], ICMPV4_ECHO_REPLY);
    assert_eq!(ident_of(&reply), 0x4242);
    assert_eq!(sequence_of(&reply), 7);
    assert_eq!(&reply[8..], b"ping payload");
    assert_eq!(internet_checksum(&reply), 0);
}

#[tokio::test]
async fn test_v6_round_trip() {
    let (manager, listener, mut wire) = manager(PingProtocol::Default);
    let dest: Destination = V6_TARGET.parse().unwrap();
    let conn = manager.dial(&dest).unwrap();

    conn.write(&echo_request(ICMPV6_ECHO_REQUEST, 0x1111, 300, b"six")).await.unwrap();
    let (sent, target) = wire.recv().await.unwrap();
    assert_eq!(ident_of(&sent), 0);
    assert_eq!(sequence_of(&sent), 1);
    assert_eq!(u16::from_be_bytes([sent[2], sent[3]]), 0, "v6 checksum is left to the stack");

    listener.inject(echo_reply(&sent), target);
    let reply = read_reply(&conn).await;
    assert_eq!(reply[0], ICMPV6_ECHO_REPLY);
    assert_eq!(ident_of(&reply), 0x1111);
    assert_eq!(sequence_of(&reply), 300);
    assert!(manager.is_socket_active(IpFamily::V6));
    assert!(!manager.is_socket_active(IpFamily::V4));
}

#[tokio::test]
async fn test_unprivileged_keeps_checksum() {
    let (manager, _listener, mut wire) = manager(PingProtocol::Unprivileged);
    let conn = manager.dial(&V4_TARGET.parse().unwrap()).unwrap();

    let request = echo_request(ICMPV4_ECHO_REQUEST, 0x4242, 7, b"data");
    conn.write(&request).await.unwrap();
    let (sent, _) = wire.recv().await.unwrap();
    assert_eq!(ident_of(&sent), 0);
    assert_eq!(&sent[2..4], &request[2..4]);
}

#[tokio::test]
async fn test_short_packet_rejected() {
    let (manager, _listener, _wire) = manager(PingProtocol::Default);
    let conn = manager.dial(&V4_TARGET.parse().unwrap()).unwrap();
    assert!(matches!(conn.write(&[8, 0, 0, 0]).await, Err(NetError::InvalidPacket)));
}

#[tokio::test]
async fn test_uncorrelated_reply_dropped() {
    let (manager, listener, mut wire) = manager(PingProtocol::Default);
    let dest: Destination = V4_TARGET.parse().unwrap();
    let first = manager.dial(&dest).unwrap();
    let second = manager.dial(&dest).unwrap();

    first.write(&echo_request(ICMPV4_ECHO_REQUEST, 1, 10, b"a")).await.unwrap();
    second.write(&echo_request(ICMPV4_ECHO_REQUEST, 2, 20, b"b")).await.unwrap();
    let (sent_a, target) = wire.recv().await.unwrap();
    let (sent_b, _) = wire.recv().await.unwrap();

    // Unknown sequence, then a request-type packet with a live sequence
    let mut stray = echo_reply(&sent_a);
    EchoPacket::new(&mut stray).unwrap().set_sequence_with_checksum_update(999);
    listener.inject(stray, target);
    listener.inject(sent_b.clone(), target);

    listener.inject(echo_reply(&sent_b), target);
    let reply = read_reply(&second).await;
    assert_eq!((ident_of(&reply), sequence_of(&reply)), (2, 20));

    listener.inject(echo_reply(&sent_a), target);
    let reply = read_reply(&first).await;
    assert_eq!((ident_of(&reply), sequence_of(&reply)), (1, 10));
}

#[tokio::test]
async fn test_reply_from_other_source_dropped() {
    let (manager, listener, mut wire) = manager(PingProtocol::Default);
    let conn = manager.dial(&V4_TARGET.parse().unwrap()).unwrap();

    conn.write(&echo_request(ICMPV4_ECHO_REQUEST, 5, 5, b"x")).await.unwrap();
    let (sent, _) = wire.recv().await.unwrap();
    listener.inject(echo_reply(&sent), "192.0.2.77".parse().unwrap());

    let mut buf = [0u8; 64];
    let pending = tokio::time::timeout(Duration::from_millis(100), conn.read(&mut buf)).await;
    assert!(pending.is_err(), "reply from another host must not be delivered");
}

#[tokio::test]
async fn test_second_reply_dropped_while_slot_full() {
    let (manager, listener, mut wire) = manager(PingProtocol::Default);
    let conn = manager.dial(&V4_TARGET.parse().unwrap()).unwrap();

    conn.write(&echo_request(ICMPV4_ECHO_REQUEST, 9, 1, b"one")).await.unwrap();
    conn.write(&echo_request(ICMPV4_ECHO_REQUEST, 9, 2, b"two")).await.unwrap();
    let (sent_one, target) = wire.recv().await.unwrap();
    let (sent_two, _) = wire.recv().await.unwrap();

    listener.inject(echo_reply(&sent_one), target);
    listener.inject(echo_reply(&sent_two), target);
    // Let the read loop dispatch both before anything is read
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reply = read_reply(&conn).await;
    assert_eq!(sequence_of(&reply), 1);

    let mut buf = [0u8; 64];
    let dropped = tokio::time::timeout(Duration::from_millis(100), conn.read(&mut buf)).await;
    assert!(dropped.is_err(), "second reply should have been dropped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dials_share_socket_and_client() {
    let (manager, listener, _wire) = manager(PingProtocol::Default);
    let dest: Destination = V4_TARGET.parse().unwrap();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let manager = manager.clone();
            let dest = dest.clone();
            tokio::spawn(async move { manager.dial(&dest).unwrap().client_id() })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    assert!(ids.iter().all(|id| id.is_some() && *id == ids[0]));
    assert_eq!(listener.listens(), 1);
    assert_eq!(manager.client_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_client_expires() {
    let (manager, _listener, _wire) = manager(PingProtocol::Default);
    let dest: Destination = V4_TARGET.parse().unwrap();
    let conn = manager.dial(&dest).unwrap();
    let first_id = conn.client_id();
    assert_eq!(manager.client_count(), 1);

    tokio::time::sleep(ECHO_CLIENT_IDLE_TIMEOUT + Duration::from_secs(1)).await;

    assert_eq!(manager.client_count(), 0);
    assert!(conn.is_closed());
    let request = echo_request(ICMPV4_ECHO_REQUEST, 1, 1, b"late");
    assert!(matches!(conn.write(&request).await, Err(NetError::ClosedPipe)));
    let mut buf = [0u8; 64];
    assert!(matches!(conn.read(&mut buf).await, Err(NetError::ClosedPipe)));

    let fresh = manager.dial(&dest).unwrap();
    assert_ne!(fresh.client_id(), first_id);
    assert_eq!(manager.client_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_activity_keeps_client_alive() {
    let (manager, _listener, _wire) = manager(PingProtocol::Default);
    let conn = manager.dial(&V4_TARGET.parse().unwrap()).unwrap();

    for seq in 0..5 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        conn.write(&echo_request(ICMPV4_ECHO_REQUEST, 1, seq, b"keepalive")).await.unwrap();
    }
    assert!(!conn.is_closed());
    assert_eq!(manager.client_count(), 1);
}

#[tokio::test]
async fn test_closed_connection_leaves_client() {
    let (manager, _listener, _wire) = manager(PingProtocol::Default);
    let dest: Destination = V4_TARGET.parse().unwrap();
    let a = manager.dial(&dest).unwrap();
    let b = manager.dial(&dest).unwrap();

    a.close();
    assert!(matches!(
        a.write(&echo_request(ICMPV4_ECHO_REQUEST, 1, 1, b"")).await,
        Err(NetError::ClosedPipe)
    ));
    b.write(&echo_request(ICMPV4_ECHO_REQUEST, 1, 1, b"")).await.unwrap();
    assert_eq!(manager.client_count(), 1);
}

#[tokio::test]
async fn test_read_error_closes_only_that_family() {
    let (manager, listener, _wire) = manager(PingProtocol::Default);
    let v4 = manager.dial(&V4_TARGET.parse().unwrap()).unwrap();
    let _v6 = manager.dial(&V6_TARGET.parse().unwrap()).unwrap();
    assert_eq!(listener.listens(), 2);

    listener.break_socket(IpFamily::V4);
    tokio::time::timeout(Duration::from_secs(1), async {
        while manager.is_socket_active(IpFamily::V4) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("v4 socket should close after a read error");
    assert!(manager.is_socket_active(IpFamily::V6));

    // Writes on the old connection do not reopen the family
    let err = v4
        .write(&echo_request(ICMPV4_ECHO_REQUEST, 1, 1, b"again"))
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::ClosedPipe));
    assert!(!manager.is_socket_active(IpFamily::V4));
    assert_eq!(listener.listens(), 2);

    // A fresh dial does
    let redialed = manager.dial(&V4_TARGET.parse().unwrap()).unwrap();
    redialed
        .write(&echo_request(ICMPV4_ECHO_REQUEST, 1, 1, b"again"))
        .await
        .unwrap();
    assert!(manager.is_socket_active(IpFamily::V4));
    assert_eq!(listener.listens(), 3);
}
