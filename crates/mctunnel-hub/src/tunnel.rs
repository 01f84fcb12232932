//! One tunnel per connected agent.
//!
//! A [`Tunnel`] owns the hub side of a single agent gRPC stream and
//! multiplexes logical packet connections over it. Inbound packets are
//! routed to the matching [`PacketConn`] by conn_id; outbound packets from
//! every packet connection funnel through one bounded queue whose receiver
//! side is the gRPC response stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mctunnel_proto::{ControlCode, Packet};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tonic::{Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TunnelError;

/// Buffer for outgoing packets toward the agent.
pub(crate) const OUTGOING_QUEUE_SIZE: usize = 1000;

/// Buffer for each packet connection's incoming queue.
const INCOMING_QUEUE_SIZE: usize = 100;

/// How long a routed packet may wait on a contended incoming queue before
/// it is dropped. Tolerates the window between the closed-flag check and
/// the actual close.
const ENQUEUE_RETRY: Duration = Duration::from_millis(100);

/// Per-connection state kept in the tunnel's registry. The owning
/// [`PacketConn`] holds the receiver side; the tunnel only ever touches the
/// sender half, so there is no ownership cycle between the two.
struct PacketConnHandle {
    incoming_tx: mpsc::Sender<Packet>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

pub struct Tunnel {
    id: Uuid,
    cluster_name: String,
    created_at: DateTime<Utc>,
    outgoing: mpsc::Sender<Result<Packet, Status>>,
    conns: RwLock<HashMap<i64, PacketConnHandle>>,
    next_conn_id: AtomicI64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Tunnel {
    pub(crate) fn new(cluster_name: &str, outgoing: mpsc::Sender<Result<Packet, Status>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_name: cluster_name.to_string(),
            created_at: Utc::now(),
            outgoing,
            conns: RwLock::new(HashMap::new()),
            next_conn_id: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open a new logical packet connection on this tunnel.
    ///
    /// Conn ids start at 1 and increase monotonically; an id is never
    /// reused within a tunnel.
    pub fn new_packet_conn(self: &Arc<Self>) -> Result<PacketConn, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = self.cancel.child_token();

        {
            let mut conns = self.conns.write().unwrap();
            // The tunnel may have closed between the first check and taking
            // the lock; a handle registered past that point would leak.
            if self.is_closed() {
                return Err(TunnelError::Closed);
            }
            conns.insert(
                conn_id,
                PacketConnHandle {
                    incoming_tx,
                    closed: closed.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        debug!(
            cluster = %self.cluster_name,
            tunnel_id = %self.id,
            conn_id,
            "Opened packet connection"
        );

        Ok(PacketConn {
            id: conn_id,
            incoming: incoming_rx,
            sender: PacketConnSender {
                id: conn_id,
                tunnel: self.clone(),
                closed,
                cancel,
            },
        })
    }

    /// Enqueue a packet toward the agent. Non-blocking.
    pub fn send(&self, packet: Packet) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        match self.outgoing.try_send(Ok(packet)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TunnelError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TunnelError::Closed),
        }
    }

    /// Receive packets from the agent until the stream dies or the agent
    /// drains. The returned error is what ended the tunnel.
    pub(crate) async fn serve(self: &Arc<Self>, mut inbound: Streaming<Packet>) -> TunnelError {
        info!(cluster = %self.cluster_name, tunnel_id = %self.id, "Serving tunnel");

        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => return TunnelError::Closed,
                msg = inbound.message() => match msg {
                    Ok(Some(packet)) => packet,
                    Ok(None) => return TunnelError::StreamEnded,
                    Err(status) => return TunnelError::Transport(status),
                },
            };

            if let Err(err) = self.dispatch_incoming(packet).await {
                return err;
            }
        }
    }

    /// Route one inbound packet. Returns an error only for conditions that
    /// terminate the whole tunnel.
    pub(crate) async fn dispatch_incoming(&self, packet: Packet) -> Result<(), TunnelError> {
        match ControlCode::try_from(packet.code) {
            Ok(ControlCode::Data) => {
                self.route_data(packet).await;
                Ok(())
            }
            Ok(ControlCode::Error) => {
                self.route_error(packet).await;
                Ok(())
            }
            Ok(ControlCode::Drain) => {
                info!(
                    cluster = %self.cluster_name,
                    tunnel_id = %self.id,
                    "Received drain signal from agent"
                );
                Err(TunnelError::Drained)
            }
            Err(_) => {
                warn!(
                    cluster = %self.cluster_name,
                    code = packet.code,
                    "Dropping packet with unknown control code"
                );
                Ok(())
            }
        }
    }

    async fn route_data(&self, packet: Packet) {
        let conn_id = packet.conn_id;
        let handle = self.lookup(conn_id);

        match handle {
            Some((incoming_tx, closed)) => {
                deliver(&incoming_tx, &closed, packet).await;
            }
            None => {
                warn!(
                    cluster = %self.cluster_name,
                    conn_id,
                    "Received data for unknown packet connection"
                );
                // Diagnostics lose to liveness: if the outgoing queue is
                // full the error packet is dropped rather than blocking
                // the reader.
                let error = Packet::error(conn_id, format!("unknown packet connection {conn_id}"));
                if self.outgoing.try_send(Ok(error)).is_err() {
                    warn!(conn_id, "Outgoing queue full, dropping error packet");
                }
            }
        }
    }

    async fn route_error(&self, packet: Packet) {
        let conn_id = packet.conn_id;
        if let Some((incoming_tx, closed)) = self.lookup(conn_id) {
            // Forwarded into the incoming queue so the owner observes the
            // failure in order and closes its side.
            deliver(&incoming_tx, &closed, packet).await;
        }
    }

    fn lookup(&self, conn_id: i64) -> Option<(mpsc::Sender<Packet>, Arc<AtomicBool>)> {
        let conns = self.conns.read().unwrap();
        conns
            .get(&conn_id)
            .map(|h| (h.incoming_tx.clone(), h.closed.clone()))
    }

    /// Drop a packet connection from the registry. Idempotent.
    pub(crate) fn remove_conn(&self, conn_id: i64) {
        let removed = {
            let mut conns = self.conns.write().unwrap();
            conns.remove(&conn_id)
        };

        if let Some(handle) = removed {
            handle.closed.store(true, Ordering::SeqCst);
            handle.cancel.cancel();
            debug!(
                cluster = %self.cluster_name,
                tunnel_id = %self.id,
                conn_id,
                "Removed packet connection"
            );
        }
    }

    /// Close the tunnel and every packet connection on it. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();

        let mut conns = self.conns.write().unwrap();
        for (_, handle) in conns.drain() {
            handle.closed.store(true, Ordering::SeqCst);
            handle.cancel.cancel();
        }
        drop(conns);

        // Terminate the response stream so the agent observes the close.
        let _ = self
            .outgoing
            .try_send(Err(Status::unavailable("tunnel closed")));

        info!(cluster = %self.cluster_name, tunnel_id = %self.id, "Closed tunnel");
    }

    /// Number of live packet connections, for tests and introspection.
    pub fn packet_conn_count(&self) -> usize {
        self.conns.read().unwrap().len()
    }
}

/// Guarded enqueue into a packet connection's incoming queue: check the
/// closed flag, try a non-blocking send, then retry briefly. Losing the
/// race with a concurrent close drops the packet instead of wedging the
/// tunnel reader.
async fn deliver(incoming_tx: &mpsc::Sender<Packet>, closed: &AtomicBool, packet: Packet) {
    let conn_id = packet.conn_id;

    if closed.load(Ordering::SeqCst) {
        debug!(conn_id, "Dropping packet for closed packet connection");
        return;
    }

    match incoming_tx.try_send(packet) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(conn_id, "Dropping packet for closed packet connection");
        }
        Err(mpsc::error::TrySendError::Full(packet)) => {
            match timeout(ENQUEUE_RETRY, incoming_tx.send(packet)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!(conn_id, "Dropping packet for closed packet connection");
                }
                Err(_) => {
                    warn!(conn_id, "Incoming queue full, dropping packet");
                }
            }
        }
    }
}

/// Cheap cloneable sending half of a [`PacketConn`].
#[derive(Clone)]
pub struct PacketConnSender {
    id: i64,
    tunnel: Arc<Tunnel>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl PacketConnSender {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Send a packet to the agent on this conn_id.
    pub fn send(&self, mut packet: Packet) -> Result<(), TunnelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TunnelError::Closed);
        }
        packet.conn_id = self.id;
        self.tunnel.send(packet)
    }
}

/// One logical byte pipe multiplexed inside a tunnel.
///
/// The owner reads agent packets through [`recv`](PacketConn::recv) and
/// writes through the sender half. Dropping the connection closes it.
pub struct PacketConn {
    id: i64,
    incoming: mpsc::Receiver<Packet>,
    sender: PacketConnSender,
}

impl PacketConn {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// A cloneable handle for the sending direction.
    pub fn sender(&self) -> PacketConnSender {
        self.sender.clone()
    }

    /// Send a packet to the agent on this conn_id.
    pub fn send(&self, packet: Packet) -> Result<(), TunnelError> {
        self.sender.send(packet)
    }

    /// Next packet from the agent. `None` means the connection closed.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.incoming.recv().await
    }

    /// Close the connection and deregister it from the tunnel. Idempotent.
    pub fn close(&self) {
        if self.sender.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sender.cancel.cancel();
        self.sender.tunnel.remove_conn(self.id);
    }
}

impl Drop for PacketConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tunnel(outgoing_capacity: usize) -> (Arc<Tunnel>, mpsc::Receiver<Result<Packet, Status>>)
    {
        let (tx, rx) = mpsc::channel(outgoing_capacity);
        (Arc::new(Tunnel::new("test-cluster", tx)), rx)
    }

    #[tokio::test]
    async fn test_conn_ids_are_monotonic() {
        let (tunnel, _rx) = test_tunnel(16);

        let a = tunnel.new_packet_conn().unwrap();
        let b = tunnel.new_packet_conn().unwrap();
        let c = tunnel.new_packet_conn().unwrap();

        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(c.id(), 3);
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_close() {
        let (tunnel, _rx) = test_tunnel(16);

        let a = tunnel.new_packet_conn().unwrap();
        let first = a.id();
        drop(a);

        let b = tunnel.new_packet_conn().unwrap();
        assert!(b.id() > first);
    }

    #[tokio::test]
    async fn test_new_packet_conn_fails_when_closed() {
        let (tunnel, _rx) = test_tunnel(16);

        tunnel.close();
        assert!(matches!(
            tunnel.new_packet_conn(),
            Err(TunnelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_send_surfaces_backpressure() {
        let (tunnel, _rx) = test_tunnel(1);

        tunnel.send(Packet::data(1, vec![0])).unwrap();
        let err = tunnel.send(Packet::data(1, vec![1])).unwrap_err();
        assert!(matches!(err, TunnelError::Backpressure));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_closes_conns() {
        let (tunnel, _rx) = test_tunnel(16);

        let mut conn = tunnel.new_packet_conn().unwrap();
        assert_eq!(tunnel.packet_conn_count(), 1);

        tunnel.close();
        tunnel.close();

        assert_eq!(tunnel.packet_conn_count(), 0);
        assert!(matches!(conn.send(Packet::data(0, vec![])), Err(TunnelError::Closed)));
        assert!(conn.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_data_routed_to_matching_conn() {
        let (tunnel, _rx) = test_tunnel(16);

        let mut conn = tunnel.new_packet_conn().unwrap();
        tunnel
            .dispatch_incoming(Packet::data(conn.id(), b"payload".to_vec()))
            .await
            .unwrap();

        let packet = conn.recv().await.unwrap();
        assert_eq!(packet.data, b"payload");
    }

    #[tokio::test]
    async fn test_data_for_unknown_conn_returns_error_packet() {
        let (tunnel, mut rx) = test_tunnel(16);

        tunnel
            .dispatch_incoming(Packet::data(99, b"x".to_vec()))
            .await
            .unwrap();

        let sent = rx.recv().await.unwrap().unwrap();
        assert_eq!(sent.conn_id, 99);
        assert_eq!(ControlCode::try_from(sent.code), Ok(ControlCode::Error));
        assert!(sent.error_message.contains("unknown packet connection"));
    }

    #[tokio::test]
    async fn test_error_packet_forwarded_to_owner() {
        let (tunnel, _rx) = test_tunnel(16);

        let mut conn = tunnel.new_packet_conn().unwrap();
        tunnel
            .dispatch_incoming(Packet::error(conn.id(), "upstream died"))
            .await
            .unwrap();

        let packet = conn.recv().await.unwrap();
        assert_eq!(ControlCode::try_from(packet.code), Ok(ControlCode::Error));
        assert_eq!(packet.error_message, "upstream died");
    }

    #[tokio::test]
    async fn test_drain_terminates_tunnel() {
        let (tunnel, _rx) = test_tunnel(16);

        let err = tunnel.dispatch_incoming(Packet::drain()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Drained));
    }

    #[tokio::test]
    async fn test_dropping_conn_deregisters_it() {
        let (tunnel, _rx) = test_tunnel(16);

        let conn = tunnel.new_packet_conn().unwrap();
        assert_eq!(tunnel.packet_conn_count(), 1);
        drop(conn);
        assert_eq!(tunnel.packet_conn_count(), 0);
    }

    #[tokio::test]
    async fn test_late_data_after_conn_close_is_dropped() {
        let (tunnel, mut rx) = test_tunnel(16);

        let conn = tunnel.new_packet_conn().unwrap();
        let conn_id = conn.id();
        drop(conn);

        // The conn is gone, so the tunnel reports it as unknown.
        tunnel
            .dispatch_incoming(Packet::data(conn_id, b"late".to_vec()))
            .await
            .unwrap();

        let sent = rx.recv().await.unwrap().unwrap();
        assert_eq!(ControlCode::try_from(sent.code), Ok(ControlCode::Error));
    }
}
