//! Registry of active tunnels, one per cluster.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use mctunnel_proto::Packet;
use tokio::sync::mpsc;
use tonic::Status;
use tracing::info;
use uuid::Uuid;

use crate::tunnel::Tunnel;

/// Maps cluster names to their tunnels. At most one tunnel per cluster is
/// live at any instant; a reconnecting agent replaces its predecessor.
#[derive(Default)]
pub struct TunnelManager {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a tunnel for `cluster_name`.
    ///
    /// An existing tunnel for the same cluster is closed before the
    /// replacement becomes visible.
    pub fn register(
        &self,
        cluster_name: &str,
        outgoing: mpsc::Sender<Result<Packet, Status>>,
    ) -> Arc<Tunnel> {
        let tunnel = Arc::new(Tunnel::new(cluster_name, outgoing));

        let mut tunnels = self.tunnels.write().unwrap();
        if let Some(old) = tunnels.get(cluster_name) {
            info!(
                cluster = %cluster_name,
                old_tunnel_id = %old.id(),
                new_tunnel_id = %tunnel.id(),
                "Replacing existing tunnel for cluster"
            );
            old.close();
        }
        tunnels.insert(cluster_name.to_string(), tunnel.clone());

        info!(cluster = %cluster_name, tunnel_id = %tunnel.id(), "Registered tunnel");
        tunnel
    }

    pub fn get(&self, cluster_name: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().unwrap().get(cluster_name).cloned()
    }

    /// Remove the tunnel for `cluster_name`, but only if it still is the
    /// one identified by `tunnel_id`. A stale remove racing a replacement
    /// is a no-op.
    pub fn remove(&self, cluster_name: &str, tunnel_id: Uuid) {
        let mut tunnels = self.tunnels.write().unwrap();
        if let Some(current) = tunnels.get(cluster_name) {
            if current.id() == tunnel_id {
                tunnels.remove(cluster_name);
                info!(cluster = %cluster_name, tunnel_id = %tunnel_id, "Removed tunnel");
            }
        }
    }

    /// Close every tunnel and empty the registry.
    pub fn close_all(&self) {
        let mut tunnels = self.tunnels.write().unwrap();
        for (cluster_name, tunnel) in tunnels.drain() {
            tunnel.close();
            info!(cluster = %cluster_name, tunnel_id = %tunnel.id(), "Closed tunnel");
        }
    }

    pub fn count(&self) -> usize {
        self.tunnels.read().unwrap().len()
    }
}
