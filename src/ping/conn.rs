use crate::base::destination::IpFamily;
use crate::base::neterror::NetError;
use crate::ping::client::{EchoClient, EchoReply, PendingEcho};
use crate::ping::manager::ManagerInner;
use crate::ping::packet::{EchoPacket, ECHO_HEADER_LEN};
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// One logical echo flow multiplexed over the family's shared socket.
///
/// Replies are correlated by the sequence number the client assigned on the
/// wire; `read` hands back the packet with the caller's own identifier and
/// sequence restored. At most one unread reply is buffered.
pub struct VirtualEchoConnection {
    client: Weak<EchoClient>,
    manager: Weak<ManagerInner>,
    family: IpFamily,
    remote: IpAddr,
    privileged: bool,
    scope: CancellationToken,
    reply_to: mpsc::Sender<EchoReply>,
    inbound: Mutex<mpsc::Receiver<EchoReply>>,
}

impl VirtualEchoConnection {
    pub(crate) fn new(
        client: &Arc<EchoClient>,
        manager: Weak<ManagerInner>,
        privileged: bool,
    ) -> Self {
        let (reply_to, inbound) = mpsc::channel(1);
        Self {
            client: Arc::downgrade(client),
            manager,
            family: client.family(),
            remote: client.remote(),
            privileged,
            scope: client.scope().child_token(),
            reply_to,
            inbound: Mutex::new(inbound),
        }
    }

    pub fn remote(&self) -> IpAddr {
        self.remote
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    /// Identifier of the shared client, if it is still alive.
    pub fn client_id(&self) -> Option<u16> {
        self.client.upgrade().map(|client| client.id())
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    fn live_client(&self) -> Result<Arc<EchoClient>, NetError> {
        if self.scope.is_cancelled() {
            return Err(NetError::ClosedPipe);
        }
        self.client.upgrade().filter(|client| client.is_live()).ok_or(NetError::ClosedPipe)
    }

    /// Send one echo request. Returns the number of bytes written.
    pub async fn write(&self, packet: &[u8]) -> Result<usize, NetError> {
        let client = self.live_client()?;
        if packet.len() < ECHO_HEADER_LEN {
            return Err(NetError::InvalidPacket);
        }
        let manager = self.manager.upgrade().ok_or(NetError::ClosedPipe)?;
        client.touch();

        let mut buf = packet.to_vec();
        let mut echo = EchoPacket::new(&mut buf)?;
        let ident = echo.ident();
        let original_sequence = echo.sequence();

        let socket = manager.active_socket(self.family)?;
        drop(manager);

        let sequence = client.next_sequence();
        client.register(
            sequence,
            PendingEcho::new(self.reply_to.clone(), ident, original_sequence),
        );

        echo.set_sequence(sequence);
        echo.set_ident(0);
        if self.privileged {
            match self.family {
                IpFamily::V4 => echo.update_checksum(),
                IpFamily::V6 => echo.set_checksum(0),
            }
        }

        tracing::trace!(remote = %self.remote, sequence, "writing echo request");
        match socket.send_to(&buf, self.remote).await {
            Ok(n) => Ok(n),
            Err(e) => {
                client.take(sequence);
                tracing::debug!(remote = %self.remote, error = %e, "failed to send echo request");
                Err(e.into())
            }
        }
    }

    /// Wait for the next reply and copy it into `buf`. Returns the number of
    /// bytes copied; a reply longer than `buf` is truncated.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        self.live_client()?;

        let mut inbound = self.inbound.lock().await;
        let reply = tokio::select! {
            biased;
            _ = self.scope.cancelled() => return Err(NetError::ClosedPipe),
            reply = inbound.recv() => reply.ok_or(NetError::ClosedPipe)?,
        };
        drop(inbound);

        if let Some(client) = self.client.upgrade() {
            client.touch();
        }

        let mut packet = reply.packet.to_vec();
        let mut echo = EchoPacket::new(&mut packet)?;
        match self.family {
            IpFamily::V4 => {
                echo.set_sequence_with_checksum_update(reply.sequence);
                echo.set_ident_with_checksum_update(reply.ident);
            }
            IpFamily::V6 => {
                echo.set_sequence(reply.sequence);
                echo.set_ident(reply.ident);
            }
        }
        tracing::trace!(remote = %self.remote, sequence = reply.sequence, "read echo reply");

        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    /// Close this flow. The shared client and socket are unaffected.
    pub fn close(&self) {
        self.scope.cancel();
    }
}

impl Drop for VirtualEchoConnection {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

impl std::fmt::Debug for VirtualEchoConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualEchoConnection")
            .field("remote", &self.remote)
            .field("privileged", &self.privileged)
            .field("closed", &self.is_closed())
            .finish()
    }
}
