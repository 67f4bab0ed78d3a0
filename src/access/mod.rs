//! Access manager interface.
//!
//! The access manager is the external authority on tokens, sessions and
//! usage. The server only talks to it through [`AccessManager`]; the HTTP
//! client, the file-backed store and the in-memory test double all implement
//! the same trait.

mod file;
mod http;
mod memory;

pub use file::FileAccessManager;
pub use http::HttpAccessManager;
pub use memory::{InMemoryAccessManager, TokenOptions};

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, Result};
use crate::util::Traffic;
use crate::wire::{AccessUsage, ClientInfo, SuppressType};

/// What a server reports about itself when configuring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server software version
    pub version: String,
    /// Runtime environment description
    pub environment: String,
    /// Stable server id
    pub server_id: Uuid,
}

/// Session-related knobs handed down by the access manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Periodic usage sync interval, seconds
    pub sync_interval_secs: u64,
    /// Usage delta that forces an early sync, bytes
    pub sync_cache_size: u64,
    /// Session idle timeout, seconds
    pub idle_timeout_secs: u64,
    /// Cap on simultaneous datagram channels per session
    pub max_datagram_channels: usize,
    /// Cap on simultaneous TCP proxy channels per session
    pub max_tcp_channels: usize,
    /// Cap on in-flight outbound TCP connects per session
    pub max_tcp_connect_wait: usize,
    /// Outbound TCP connect timeout, milliseconds
    pub tcp_connect_timeout_ms: u64,
    /// Kernel buffer size applied to proxy sockets, bytes; 0 leaves the default
    pub tcp_buffer_size: usize,
    /// Distinct remote endpoints within the window that trip the net-scan detector
    pub net_scan_limit: usize,
    /// Net-scan detection window, seconds
    pub net_scan_window_secs: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sync_interval_secs: 3,
            sync_cache_size: 100 * 1024 * 1024,
            idle_timeout_secs: 1800,
            max_datagram_channels: 8,
            max_tcp_channels: 128,
            max_tcp_connect_wait: 64,
            tcp_connect_timeout_ms: 30_000,
            tcp_buffer_size: 0,
            net_scan_limit: 200,
            net_scan_window_secs: 10,
        }
    }
}

/// What the session is allowed to log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingOptions {
    /// Log client IPs
    #[serde(default)]
    pub track_client_ip: bool,
    /// Log local proxy ports
    #[serde(default)]
    pub track_local_port: bool,
}

/// Configuration pushed to a server by the access manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigData {
    /// TCP endpoints to listen on
    pub tcp_endpoints: Vec<SocketAddr>,
    /// UDP endpoints for the UDP channel; empty disables it
    pub udp_endpoints: Vec<SocketAddr>,
    /// Session knobs
    pub session_options: SessionOptions,
    /// Tracking toggles
    pub tracking_options: TrackingOptions,
    /// Server secret (hex, 16 bytes)
    pub server_secret: String,
    /// Opaque version of this config; status replies echo the current one
    pub config_code: String,
    /// How long to wait before retrying a failed configure, seconds
    #[serde(default = "default_configure_interval")]
    pub configure_interval_secs: u64,
}

fn default_configure_interval() -> u64 {
    30
}

/// Periodic server heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Live session count
    pub session_count: usize,
    /// Sum of tunnel speeds, bytes per second
    pub tunnel_speed: Traffic,
    /// Config code the server is running with
    pub config_code: String,
}

/// Reply to a status heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCommand {
    /// Desired config code; a mismatch makes the server re-configure
    pub config_code: String,
}

/// Session-create call, the server-side projection of a Hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequestEx {
    /// Token being redeemed
    pub token_id: Uuid,
    /// Client identification
    pub client_info: ClientInfo,
    /// Client id encrypted under the token secret (hex)
    pub encrypted_client_id: String,
    /// Where the client connected from, when tracking allows it
    pub client_ip: Option<IpAddr>,
    /// Which host endpoint took the connection
    pub host_endpoint: SocketAddr,
}

/// Base result of access-manager session calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionResponseBase {
    /// Outcome
    pub error_code: ErrorCode,
    /// Detail for non-Ok outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Who suppressed the session, if anyone
    #[serde(default)]
    pub suppressed_by: SuppressType,
    /// Usage snapshot
    #[serde(default)]
    pub access_usage: AccessUsage,
}

/// Extended result of create/get: everything needed to run the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionResponseEx {
    /// Base fields
    #[serde(flatten)]
    pub base: SessionResponseBase,
    /// Session id, non-zero on success
    pub session_id: u64,
    /// Session key (hex, 16 bytes)
    pub session_key: String,
    /// Endpoint to retry against on RedirectHost
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_host_endpoint: Option<SocketAddr>,
}

/// Error body of the HTTP access-manager API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Exception type name on the manager side
    pub exception_type_name: String,
    /// Human-readable message
    pub message: String,
}

/// The external authority on tokens, sessions and usage.
///
/// All methods are safe to call concurrently; the server shares one manager
/// across every session.
#[async_trait]
pub trait AccessManager: Send + Sync {
    /// Register this server and fetch its configuration.
    async fn configure(&self, server_info: ServerInfo) -> Result<ServerConfigData>;

    /// Report liveness; the reply may demand a re-configure.
    async fn status(&self, status: ServerStatus) -> Result<ServerCommand>;

    /// Create a session for a Hello.
    async fn session_create(&self, request: SessionRequestEx) -> Result<SessionResponseEx>;

    /// Look a session up again, typically after a server restart.
    async fn session_get(
        &self,
        session_id: u64,
        host_endpoint: SocketAddr,
        client_ip: Option<IpAddr>,
    ) -> Result<SessionResponseEx>;

    /// Record a usage delta; with `close_session` the session also closes.
    async fn add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        close_session: bool,
    ) -> Result<SessionResponseBase>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_response_flattens() {
        let response = SessionResponseEx {
            base: SessionResponseBase {
                error_code: ErrorCode::Ok,
                ..SessionResponseBase::default()
            },
            session_id: 7,
            session_key: "aa".repeat(16),
            redirect_host_endpoint: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        // Base fields serialize at the top level, as the HTTP API expects.
        assert!(json.contains("\"error_code\":\"Ok\""));
        assert!(json.contains("\"session_id\":7"));
    }
}
