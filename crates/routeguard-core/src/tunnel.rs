//! VPN tunnel collaborator interface
//!
//! The tunnel process itself lives outside this crate; the dispatcher only
//! asks whether it is up and which interface to hand a flow to.

use parking_lot::RwLock;
use serde::Serialize;

/// Handle to the active tunnel interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelPath {
    /// Interface name (e.g. `tun0`)
    pub interface: String,
}

impl TunnelPath {
    /// Create a path for `interface`
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

impl std::fmt::Display for TunnelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.interface)
    }
}

/// Tunnel status as seen by the dispatcher
#[cfg_attr(test, mockall::automock)]
pub trait VpnTunnel: Send + Sync {
    /// Whether a tunnel is currently connected
    fn is_connected(&self) -> bool;

    /// The interface to forward through, if connected
    fn active_path(&self) -> Option<TunnelPath>;
}

/// Shared tunnel status driven by whoever manages the tunnel process
#[derive(Debug, Default)]
pub struct TunnelStatus {
    path: RwLock<Option<TunnelPath>>,
}

impl TunnelStatus {
    /// Create a disconnected status
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the tunnel up on `interface`
    pub fn connect(&self, interface: impl Into<String>) {
        let path = TunnelPath::new(interface);
        tracing::info!(interface = %path, "VPN tunnel connected");
        *self.path.write() = Some(path);
    }

    /// Mark the tunnel down
    pub fn disconnect(&self) {
        if self.path.write().take().is_some() {
            tracing::info!("VPN tunnel disconnected");
        }
    }
}

impl VpnTunnel for TunnelStatus {
    fn is_connected(&self) -> bool {
        self.path.read().is_some()
    }

    fn active_path(&self) -> Option<TunnelPath> {
        self.path.read().clone()
    }
}
