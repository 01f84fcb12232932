//! Local connection management.
//!
//! Each conn_id the hub multiplexes over the tunnel maps to one connection
//! to the local proxy socket. Connections are created lazily when the first
//! DATA packet for an unknown conn_id arrives: the incoming queue is
//! registered and seeded with that packet synchronously, so later packets
//! dispatched while the dial is still in flight land in the same queue and
//! keep their order. A per-connection writer then consumes the queue
//! strictly sequentially, which is what upholds per-stream FIFO after the
//! concurrent dispatch above it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use mctunnel_proto::{ControlCode, Packet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DEFAULT_SOCKET_PATH;
use crate::error::DispatchError;

/// Buffer for the shared outgoing packet queue toward the hub.
const OUTGOING_QUEUE_SIZE: usize = 150;

/// Buffer for each connection's incoming packet queue.
const INCOMING_QUEUE_SIZE: usize = 150;

/// Read chunk size for local connections.
const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Timeout for dialing the local proxy socket.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a packet may wait on a contended incoming queue before the
/// dispatch fails. Covers the window between the closed-flag check and an
/// actual close.
const ENQUEUE_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ConnManagerConfig {
    pub socket_path: String,
    pub read_buffer_size: usize,
    pub outgoing_queue_size: usize,
    pub incoming_queue_size: usize,
    pub dial_timeout: Duration,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            read_buffer_size: READ_BUFFER_SIZE,
            outgoing_queue_size: OUTGOING_QUEUE_SIZE,
            incoming_queue_size: INCOMING_QUEUE_SIZE,
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

/// Sender half plus the close state of one local connection. The receiver
/// half and the socket are owned by the connection's worker tasks.
struct ConnHandle {
    incoming_tx: mpsc::Sender<Packet>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

pub struct PacketConnManager {
    config: ConnManagerConfig,
    conns: RwLock<HashMap<i64, ConnHandle>>,
    outgoing_tx: mpsc::Sender<Packet>,
    outgoing_rx: Mutex<mpsc::Receiver<Packet>>,
    cancel: CancellationToken,
}

impl PacketConnManager {
    pub fn new(config: ConnManagerConfig) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.outgoing_queue_size);
        Arc::new(Self {
            config,
            conns: RwLock::new(HashMap::new()),
            outgoing_tx,
            outgoing_rx: Mutex::new(outgoing_rx),
            cancel: CancellationToken::new(),
        })
    }

    /// The queue of packets bound for the hub. The session egress worker
    /// holds this lock for its lifetime; packets buffered while the agent
    /// is disconnected flow out on the next stream.
    pub async fn lock_outgoing(&self) -> MutexGuard<'_, mpsc::Receiver<Packet>> {
        self.outgoing_rx.lock().await
    }

    /// Route one packet from the hub.
    pub async fn dispatch(self: &Arc<Self>, packet: Packet) -> Result<(), DispatchError> {
        match ControlCode::try_from(packet.code) {
            Ok(ControlCode::Data) => self.handle_data(packet).await,
            Ok(ControlCode::Error) => {
                self.handle_error(&packet);
                Ok(())
            }
            _ => Err(DispatchError::UnknownCode {
                conn_id: packet.conn_id,
                code: packet.code,
            }),
        }
    }

    async fn handle_data(self: &Arc<Self>, packet: Packet) -> Result<(), DispatchError> {
        let conn_id = packet.conn_id;

        let handle = {
            let conns = self.conns.read().unwrap();
            conns
                .get(&conn_id)
                .map(|h| (h.incoming_tx.clone(), h.closed.clone()))
        };

        match handle {
            Some((incoming_tx, closed)) => {
                self.deliver(incoming_tx, closed, packet).await
            }
            None => {
                self.create_conn(packet);
                Ok(())
            }
        }
    }

    /// Enqueue onto an existing connection. Non-blocking with a short
    /// retry; failure collapses only this conn_id.
    async fn deliver(
        &self,
        incoming_tx: mpsc::Sender<Packet>,
        closed: Arc<AtomicBool>,
        packet: Packet,
    ) -> Result<(), DispatchError> {
        let conn_id = packet.conn_id;

        if closed.load(Ordering::SeqCst) {
            debug!(conn_id, "Dropping packet for closed connection");
            return Err(DispatchError::ConnClosed(conn_id));
        }

        match incoming_tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::ConnClosed(conn_id)),
            Err(mpsc::error::TrySendError::Full(packet)) => {
                match timeout(ENQUEUE_RETRY, incoming_tx.send(packet)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(DispatchError::ConnClosed(conn_id)),
                    Err(_) => Err(DispatchError::EnqueueTimeout(conn_id)),
                }
            }
        }
    }

    /// First packet for an unknown conn_id: register the connection and
    /// seed its queue before anything else runs, then dial in the
    /// background so a slow proxy never stalls the tunnel ingress.
    fn create_conn(self: &Arc<Self>, packet: Packet) {
        let conn_id = packet.conn_id;
        let (incoming_tx, incoming_rx) = mpsc::channel(self.config.incoming_queue_size);

        // Fresh bounded queue with capacity >= 1; cannot fail.
        let _ = incoming_tx.try_send(packet);

        let closed = Arc::new(AtomicBool::new(false));
        let cancel = self.cancel.child_token();

        {
            let mut conns = self.conns.write().unwrap();
            conns.insert(
                conn_id,
                ConnHandle {
                    incoming_tx,
                    closed,
                    cancel: cancel.clone(),
                },
            );
        }

        debug!(conn_id, "Creating local connection");

        let manager = self.clone();
        tokio::spawn(async move {
            manager.connect_and_pump(conn_id, incoming_rx, cancel).await;
        });
    }

    async fn connect_and_pump(
        self: Arc<Self>,
        conn_id: i64,
        incoming_rx: mpsc::Receiver<Packet>,
        cancel: CancellationToken,
    ) {
        let dial = timeout(
            self.config.dial_timeout,
            UnixStream::connect(&self.config.socket_path),
        );

        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                self.remove(conn_id);
                return;
            }
            dialed = dial => match dialed {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    self.dial_failed(conn_id, err.to_string());
                    return;
                }
                Err(_) => {
                    self.dial_failed(
                        conn_id,
                        format!("timed out dialing {}", self.config.socket_path),
                    );
                    return;
                }
            },
        };

        debug!(conn_id, "Connected to local proxy");

        let (read_half, write_half) = stream.into_split();

        let reader = self.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            reader.read_local(conn_id, read_half, reader_cancel).await;
        });

        let writer = self.clone();
        tokio::spawn(async move {
            writer
                .write_local(conn_id, incoming_rx, write_half, cancel)
                .await;
        });
    }

    fn dial_failed(&self, conn_id: i64, reason: String) {
        warn!(conn_id, error = %reason, "Failed to dial local proxy");

        let packet = Packet::error(conn_id, format!("connection failed: {reason}"));
        if self.outgoing_tx.try_send(packet).is_err() {
            // The hub only learns of this conn_id's fate through its own
            // timeout; dropping here beats blocking dispatch.
            warn!(conn_id, "Outgoing queue full, dropping error packet");
        }

        self.remove(conn_id);
    }

    /// Read from the local connection and forward chunks to the hub.
    async fn read_local(
        self: Arc<Self>,
        conn_id: i64,
        mut read_half: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(conn_id, "Local connection closed");
                        break;
                    }
                    Ok(n) => n,
                    Err(err) => {
                        debug!(conn_id, error = %err, "Error reading local connection");
                        break;
                    }
                },
            };

            let packet = Packet::data(conn_id, buf[..n].to_vec());
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = self.outgoing_tx.send(packet) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        self.remove(conn_id);
    }

    /// Drain the incoming queue sequentially into the local connection.
    async fn write_local(
        self: Arc<Self>,
        conn_id: i64,
        mut incoming_rx: mpsc::Receiver<Packet>,
        mut write_half: OwnedWriteHalf,
        cancel: CancellationToken,
    ) {
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = incoming_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            // Empty payloads open the connection without writing bytes.
            if packet.data.is_empty() {
                continue;
            }

            if let Err(err) = write_half.write_all(&packet.data).await {
                debug!(conn_id, error = %err, "Failed to write to local connection");
                break;
            }
        }

        self.remove(conn_id);
    }

    fn handle_error(&self, packet: &Packet) {
        warn!(
            conn_id = packet.conn_id,
            error = %packet.error_message,
            "Received error from hub"
        );
        self.remove(packet.conn_id);
    }

    /// Close and forget a connection. Safe to call from any worker under
    /// any interleaving of local errors, hub errors and shutdown.
    pub fn remove(&self, conn_id: i64) {
        let removed = {
            let mut conns = self.conns.write().unwrap();
            conns.remove(&conn_id)
        };

        if let Some(handle) = removed {
            handle.closed.store(true, Ordering::SeqCst);
            handle.cancel.cancel();
            debug!(conn_id, "Removed local connection");
        }
    }

    /// Tear down every connection.
    pub fn close(&self) {
        self.cancel.cancel();

        let mut conns = self.conns.write().unwrap();
        for (conn_id, handle) in conns.drain() {
            handle.closed.store(true, Ordering::SeqCst);
            handle.cancel.cancel();
            debug!(conn_id, "Removed local connection");
        }
    }

    pub fn conn_count(&self) -> usize {
        self.conns.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;
    use tokio::time::sleep;

    const WAIT: Duration = Duration::from_secs(5);

    fn manager_at(path: &str) -> Arc<PacketConnManager> {
        PacketConnManager::new(ConnManagerConfig {
            socket_path: path.to_string(),
            ..ConnManagerConfig::default()
        })
    }

    fn socket_dir() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.sock").to_str().unwrap().to_string();
        (dir, path)
    }

    #[tokio::test]
    async fn test_data_packets_reach_local_conn_in_order() {
        let (_dir, path) = socket_dir();
        let listener = UnixListener::bind(&path).unwrap();
        let manager = manager_at(&path);

        manager
            .dispatch(Packet::data(1, b"one".to_vec()))
            .await
            .unwrap();
        manager
            .dispatch(Packet::data(1, b"two".to_vec()))
            .await
            .unwrap();

        let (mut accepted, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let mut buf = [0u8; 6];
        timeout(WAIT, accepted.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"onetwo");
        assert_eq!(manager.conn_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_packet_opens_without_writing() {
        let (_dir, path) = socket_dir();
        let listener = UnixListener::bind(&path).unwrap();
        let manager = manager_at(&path);

        manager.dispatch(Packet::data(1, Vec::new())).await.unwrap();

        let (mut accepted, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        // No bytes may arrive from the sentinel alone.
        let mut probe = [0u8; 1];
        let read = timeout(Duration::from_millis(200), accepted.read(&mut probe)).await;
        assert!(read.is_err(), "open sentinel must not write bytes");

        manager.dispatch(Packet::data(1, b"x".to_vec())).await.unwrap();
        timeout(WAIT, accepted.read_exact(&mut probe))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&probe, b"x");
    }

    #[tokio::test]
    async fn test_local_bytes_flow_to_outgoing_queue() {
        let (_dir, path) = socket_dir();
        let listener = UnixListener::bind(&path).unwrap();
        let manager = manager_at(&path);

        manager.dispatch(Packet::data(7, Vec::new())).await.unwrap();
        let (mut accepted, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        accepted.write_all(b"response bytes").await.unwrap();

        let mut outgoing = manager.lock_outgoing().await;
        let packet = timeout(WAIT, outgoing.recv()).await.unwrap().unwrap();
        assert_eq!(packet.conn_id, 7);
        assert_eq!(ControlCode::try_from(packet.code), Ok(ControlCode::Data));
        assert_eq!(packet.data, b"response bytes");
    }

    #[tokio::test]
    async fn test_dial_failure_emits_error_packet() {
        let (_dir, path) = socket_dir();
        // No listener at the path.
        let manager = manager_at(&path);

        manager.dispatch(Packet::data(3, b"hello".to_vec())).await.unwrap();

        let mut outgoing = manager.lock_outgoing().await;
        let packet = timeout(WAIT, outgoing.recv()).await.unwrap().unwrap();
        assert_eq!(packet.conn_id, 3);
        assert_eq!(ControlCode::try_from(packet.code), Ok(ControlCode::Error));
        assert!(packet.error_message.contains("connection failed"));
        assert_eq!(manager.conn_count(), 0);
    }

    #[tokio::test]
    async fn test_error_from_hub_closes_local_conn() {
        let (_dir, path) = socket_dir();
        let listener = UnixListener::bind(&path).unwrap();
        let manager = manager_at(&path);

        manager.dispatch(Packet::data(1, Vec::new())).await.unwrap();
        let (mut accepted, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();

        manager.dispatch(Packet::error(1, "client went away")).await.unwrap();

        let mut probe = [0u8; 1];
        let n = timeout(WAIT, accepted.read(&mut probe)).await.unwrap().unwrap();
        assert_eq!(n, 0, "local connection should see EOF");
        assert_eq!(manager.conn_count(), 0);
    }

    #[tokio::test]
    async fn test_error_for_unknown_conn_is_ignored() {
        let (_dir, path) = socket_dir();
        let manager = manager_at(&path);

        manager.dispatch(Packet::error(42, "stray")).await.unwrap();
        assert_eq!(manager.conn_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_control_code_is_rejected() {
        let (_dir, path) = socket_dir();
        let manager = manager_at(&path);

        let packet = Packet {
            conn_id: 5,
            code: 99,
            data: Vec::new(),
            error_message: String::new(),
        };
        let err = manager.dispatch(packet).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownCode { conn_id: 5, .. }));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_dir, path) = socket_dir();
        let manager = manager_at(&path);

        manager.remove(9);
        manager.remove(9);
        assert_eq!(manager.conn_count(), 0);
    }

    #[tokio::test]
    async fn test_close_tears_down_all_conns() {
        let (_dir, path) = socket_dir();
        let listener = UnixListener::bind(&path).unwrap();
        let manager = manager_at(&path);

        manager.dispatch(Packet::data(1, Vec::new())).await.unwrap();
        manager.dispatch(Packet::data(2, Vec::new())).await.unwrap();
        let _first = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let _second = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        assert_eq!(manager.conn_count(), 2);

        manager.close();
        assert_eq!(manager.conn_count(), 0);

        // Dispatch after close finds no connection and fails on dial since
        // the child token is already cancelled.
        sleep(Duration::from_millis(50)).await;
    }
}
