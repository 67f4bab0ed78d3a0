//! Proxy pools: translate tunneled packets into native sockets and back.
//!
//! Each session owns one UDP pool (simple or port-efficient) and one ping
//! pool. Pools hand reply packets to the session over an mpsc; the session
//! pushes them back through the tunnel.

mod icmp;
mod udp;

pub use icmp::PingProxyPool;
pub use udp::{UdpProxyPool, UdpProxyPoolEx};

use std::net::SocketAddr;
use std::sync::Arc;

use crate::packet::Protocol;

/// Endpoint events a pool reports upward so the owner can log and feed the
/// net-scan detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    /// First packet toward a destination this pool has not seen
    NewRemote {
        /// Transport protocol
        protocol: Protocol,
        /// The destination
        destination: SocketAddr,
    },
    /// A new local socket was opened for a worker
    NewLocal {
        /// Transport protocol
        protocol: Protocol,
        /// The local address of the socket
        local: SocketAddr,
    },
}

/// Callback the owning session installs on its pools.
pub type EndpointHook = Arc<dyn Fn(EndpointEvent) + Send + Sync>;

/// Limits shared by the proxy pools.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Max workers in the simple pools (one per tunneled source)
    pub max_clients: usize,
    /// Max local sockets in the port-efficient pool
    pub max_local_endpoints: usize,
    /// Idle lifetime of flow state
    pub idle_timeout: std::time::Duration,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            max_clients: 256,
            max_local_endpoints: 32,
            idle_timeout: std::time::Duration::from_secs(120),
        }
    }
}
