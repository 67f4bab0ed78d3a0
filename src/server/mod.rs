//! Server: accept loop, request dispatch and the configure/status machine.
//!
//! Startup: `configure` against the access manager (retrying in `Waiting`
//! state until it succeeds), bind the configured endpoints, then accept.
//! Each connection carries one length-prefixed JSON request; Hello creates a
//! session, the channel requests convert the stream, Bye closes. A status
//! heartbeat runs in the background and a changed config code triggers a
//! re-configure.

pub mod manager;
pub mod netfilter;
pub mod session;

pub use manager::SessionManager;
pub use netfilter::{NetFilter, NetScanDetector};
pub use session::{Session, SessionParams};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::access::{AccessManager, ServerConfigData, ServerInfo, ServerStatus};
use crate::error::{Error, ErrorCode, Result};
use crate::wire::{
    self, HelloRequest, HelloResponse, Request, SessionRequest, SessionResponse,
    StreamProxyRequest, UdpDatagramHeader,
};

/// Interval of the status heartbeat.
const STATUS_INTERVAL: Duration = Duration::from_secs(15);

/// Interval of the maintenance tick (session reaping).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

/// Routes datagrams on the shared UDP listener to per-session inboxes.
pub struct UdpDispatcher {
    socket: Arc<UdpSocket>,
    inboxes: DashMap<u64, mpsc::Sender<(Bytes, SocketAddr)>>,
}

impl UdpDispatcher {
    /// Wrap a bound socket and start the dispatch loop.
    pub fn new(socket: Arc<UdpSocket>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            socket,
            inboxes: DashMap::new(),
        });
        tokio::spawn(Arc::clone(&dispatcher).run());
        dispatcher
    }

    /// Register a session; returns the shared socket and the inbox feed for
    /// its [`crate::tunnel::UdpChannel`].
    pub fn register(
        &self,
        session_id: u64,
    ) -> (Arc<UdpSocket>, mpsc::Receiver<(Bytes, SocketAddr)>) {
        let (tx, rx) = mpsc::channel(100);
        self.inboxes.insert(session_id, tx);
        (Arc::clone(&self.socket), rx)
    }

    /// Forget a session's inbox.
    pub fn unregister(&self, session_id: u64) {
        self.inboxes.remove(&session_id);
    }

    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 0x10000];
        loop {
            let (n, from) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("udp dispatcher recv: {e}");
                    break;
                }
            };
            let Ok(header) = UdpDatagramHeader::decode(&buf[..n]) else {
                tracing::trace!(%from, "undecodable datagram");
                continue;
            };
            let Some(inbox) = self.inboxes.get(&header.session_id) else {
                tracing::trace!(session_id = header.session_id, "datagram for unknown session");
                continue;
            };
            // A slow session drops datagrams rather than stalling the
            // dispatcher; UDP owes nobody delivery.
            let _ = inbox.try_send((Bytes::copy_from_slice(&buf[..n]), from));
        }
    }
}

/// Lifecycle state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not configured yet, or configure failed and a retry is pending
    Waiting,
    /// Accepting connections
    Ready,
    /// Stopped
    Stopped,
}

/// The slipgate server.
pub struct Server {
    access: Arc<dyn AccessManager>,
    info: ServerInfo,
    session_manager: Arc<SessionManager>,
    config: Mutex<Option<ServerConfigData>>,
    state: Mutex<ServerState>,
    bound_tcp: Mutex<Vec<SocketAddr>>,
    bound_udp: Mutex<Vec<SocketAddr>>,
    stopped: AtomicBool,
    shutdown: Notify,
}

impl Server {
    /// Create a server with the default permissive filter; nothing binds
    /// until [`Server::start`].
    pub fn new(access: Arc<dyn AccessManager>, server_id: Uuid) -> Arc<Self> {
        Self::with_netfilter(access, server_id, Arc::new(NetFilter::permissive()))
    }

    /// Create a server with an explicit destination policy.
    pub fn with_netfilter(
        access: Arc<dyn AccessManager>,
        server_id: Uuid,
        netfilter: Arc<NetFilter>,
    ) -> Arc<Self> {
        let info = ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
            server_id,
        };
        Arc::new(Self {
            session_manager: SessionManager::new(Arc::clone(&access), netfilter),
            access,
            info,
            config: Mutex::new(None),
            state: Mutex::new(ServerState::Waiting),
            bound_tcp: Mutex::new(Vec::new()),
            bound_udp: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Session manager handle.
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    /// TCP addresses actually bound (useful with port 0).
    pub fn bound_tcp_endpoints(&self) -> Vec<SocketAddr> {
        self.bound_tcp.lock().clone()
    }

    /// UDP addresses actually bound.
    pub fn bound_udp_endpoints(&self) -> Vec<SocketAddr> {
        self.bound_udp.lock().clone()
    }

    /// Configure against the access manager and start listening.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.access.configure(self.info.clone()).await?;
        self.session_manager
            .apply_options(config.session_options.clone(), config.tracking_options.clone());

        let mut bound_tcp = Vec::new();
        for endpoint in &config.tcp_endpoints {
            let listener = TcpListener::bind(endpoint).await?;
            let local = listener.local_addr()?;
            bound_tcp.push(local);
            tokio::spawn(Arc::clone(self).run_accept_loop(listener));
            tracing::info!(%local, "listening (tcp)");
        }

        let mut bound_udp = Vec::new();
        if let Some(endpoint) = config.udp_endpoints.first() {
            let socket = Arc::new(UdpSocket::bind(endpoint).await?);
            let local = socket.local_addr()?;
            bound_udp.push(local);
            let dispatcher = UdpDispatcher::new(socket);
            self.session_manager.set_udp_dispatcher(Some(dispatcher));
            tracing::info!(%local, "listening (udp)");
        }

        *self.bound_tcp.lock() = bound_tcp;
        *self.bound_udp.lock() = bound_udp;
        *self.config.lock() = Some(config);
        *self.state.lock() = ServerState::Ready;

        tokio::spawn(Arc::clone(self).run_status_loop());
        tokio::spawn(Arc::clone(self).run_maintenance_loop());
        Ok(())
    }

    /// Run until stopped, retrying the configure step while it fails.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(());
            }
            match self.start().await {
                Ok(()) => break,
                Err(e) => {
                    let retry = self
                        .config
                        .lock()
                        .as_ref()
                        .map(|c| c.configure_interval_secs)
                        .unwrap_or(30);
                    *self.state.lock() = ServerState::Waiting;
                    tracing::warn!("configure failed, retrying in {retry}s: {e}");
                    tokio::time::sleep(Duration::from_secs(retry)).await;
                }
            }
        }

        // Register for the shutdown signal before re-checking the flag so a
        // concurrent stop() cannot slip between the check and the await.
        let shutdown = self.shutdown.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        shutdown.await;
        Ok(())
    }

    /// Stop accepting and close every session.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock() = ServerState::Stopped;
        self.session_manager.dispose_all().await;
        self.shutdown.notify_waiters();
        tracing::info!("server stopped");
    }

    async fn run_accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            tracing::debug!(%peer, "connection ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                }
            }
        }
    }

    async fn run_status_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(STATUS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let Some(config_code) = self.config.lock().as_ref().map(|c| c.config_code.clone())
            else {
                continue;
            };

            let status = ServerStatus {
                session_count: self.session_manager.session_count(),
                tunnel_speed: self.session_manager.total_speed(),
                config_code: config_code.clone(),
            };
            match self.access.status(status).await {
                Ok(command) => {
                    if command.config_code != config_code {
                        tracing::info!("config code changed, re-reading configuration");
                        match self.access.configure(self.info.clone()).await {
                            Ok(config) => {
                                self.session_manager.apply_options(
                                    config.session_options.clone(),
                                    config.tracking_options.clone(),
                                );
                                *self.config.lock() = Some(config);
                            }
                            Err(e) => tracing::warn!("re-configure failed: {e}"),
                        }
                    }
                }
                Err(e) => tracing::debug!("status heartbeat failed: {e}"),
            }
        }
    }

    async fn run_maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            self.session_manager.cleanup().await;
        }
    }

    /// Read the one request this connection carries and dispatch it.
    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let host_endpoint = stream.local_addr()?;

        let request: Request = wire::read_message(&mut stream).await?;
        tracing::debug!(%peer, request_id = request.request_id(), "request");

        // Per-request errors become a response on the same stream; the
        // stream closes either way.
        match request {
            Request::Hello(hello) => {
                if let Err(e) = self
                    .handle_hello(&mut stream, hello, peer, host_endpoint)
                    .await
                {
                    let response = SessionResponse::error(e.error_code(), e.to_string());
                    let _ = wire::write_message(&mut stream, &response).await;
                    return Err(e);
                }
                Ok(())
            }
            Request::TcpDatagramChannel(request) => {
                self.handle_tcp_datagram(stream, request, host_endpoint, peer)
                    .await
            }
            Request::StreamProxyChannel(request) => {
                self.handle_stream_proxy(stream, request, host_endpoint, peer)
                    .await
            }
            Request::UdpPacket(_) => {
                // Reserved in the protocol; report instead of dropping the
                // connection silently.
                let response = SessionResponse::error(
                    ErrorCode::GeneralError,
                    "UdpPacket is not implemented",
                );
                wire::write_message(&mut stream, &response).await
            }
            Request::Bye(request) => {
                match self.handle_bye(request, host_endpoint, peer).await {
                    Ok(()) => wire::write_message(&mut stream, &SessionResponse::ok()).await,
                    Err(e) => {
                        let response = SessionResponse::error(e.error_code(), e.to_string());
                        let _ = wire::write_message(&mut stream, &response).await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn handle_hello(
        &self,
        stream: &mut TcpStream,
        hello: HelloRequest,
        peer: SocketAddr,
        host_endpoint: SocketAddr,
    ) -> Result<()> {
        let request = crate::access::SessionRequestEx {
            token_id: hello.token_id,
            client_info: hello.client_info.clone(),
            encrypted_client_id: hello.encrypted_client_id.clone(),
            client_ip: Some(peer.ip()),
            host_endpoint,
        };

        let (session, response) = self.session_manager.create_session(request).await?;
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| Error::config("server not configured"))?;

        let hello_response = HelloResponse {
            response: SessionResponse {
                error_code: response.base.error_code,
                error_message: response.base.error_message.clone(),
                suppressed_by: response.base.suppressed_by,
                access_usage: response.base.access_usage,
                redirect_host_endpoint: response.redirect_host_endpoint,
            },
            session_id: response.session_id,
            session_key: response.session_key.clone(),
            server_secret: config.server_secret.clone(),
            server_protocol_version: crate::PROTOCOL_VERSION,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout_ms: 30_000,
            tcp_reuse_timeout_ms: 40_000,
            tcp_endpoints: self.bound_tcp_endpoints(),
            udp_endpoints: self.bound_udp_endpoints(),
            max_datagram_channel_count: config.session_options.max_datagram_channels,
            include_ip_ranges: None,
            packet_capture_include_ip_ranges: None,
            is_ipv6_supported: true,
            measurement_id: None,
        };
        wire::write_message(stream, &hello_response).await?;

        if let Some(session) = session {
            tracing::info!(
                session_id = session.session_id(),
                %peer,
                "session created"
            );
        }
        Ok(())
    }

    async fn handle_tcp_datagram(
        &self,
        mut stream: TcpStream,
        request: SessionRequest,
        host_endpoint: SocketAddr,
        peer: SocketAddr,
    ) -> Result<()> {
        let session = match self
            .session_manager
            .get_or_recover(
                request.session_id,
                &request.session_key,
                host_endpoint,
                Some(peer.ip()),
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let response = SessionResponse::error(e.error_code(), e.to_string());
                let _ = wire::write_message(&mut stream, &response).await;
                return Err(e);
            }
        };

        let status = session.status();
        let response = SessionResponse {
            error_code: ErrorCode::Ok,
            error_message: None,
            suppressed_by: status.suppressed_by,
            access_usage: status.access_usage,
            redirect_host_endpoint: None,
        };
        wire::write_message(&mut stream, &response).await?;

        session.add_stream_datagram_channel(stream)
    }

    async fn handle_stream_proxy(
        &self,
        mut stream: TcpStream,
        request: StreamProxyRequest,
        host_endpoint: SocketAddr,
        peer: SocketAddr,
    ) -> Result<()> {
        let session = match self
            .session_manager
            .get_or_recover(
                request.session.session_id,
                &request.session.session_key,
                host_endpoint,
                Some(peer.ip()),
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let response = SessionResponse::error(e.error_code(), e.to_string());
                let _ = wire::write_message(&mut stream, &response).await;
                return Err(e);
            }
        };

        match session.connect_stream_proxy(request.destination).await {
            Ok(host_stream) => {
                wire::write_message(&mut stream, &SessionResponse::ok()).await?;
                session.start_stream_proxy(stream, host_stream)
            }
            Err(e) => {
                // Connect failures are reported on the same stream.
                let response = SessionResponse::error(e.error_code(), e.to_string());
                wire::write_message(&mut stream, &response).await?;
                Err(e)
            }
        }
    }

    async fn handle_bye(
        &self,
        request: SessionRequest,
        host_endpoint: SocketAddr,
        peer: SocketAddr,
    ) -> Result<()> {
        let session = self
            .session_manager
            .get_or_recover(
                request.session_id,
                &request.session_key,
                host_endpoint,
                Some(peer.ip()),
            )
            .await?;
        self.session_manager
            .close_session(session.session_id(), ErrorCode::SessionClosed)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{InMemoryAccessManager, ServerConfigData, SessionOptions, TokenOptions, TrackingOptions};
    use crate::crypto::encrypt_client_id;
    use crate::wire::ClientInfo;

    async fn started_server(
        access: Arc<InMemoryAccessManager>,
    ) -> (Arc<Server>, SocketAddr) {
        access.set_config(ServerConfigData {
            tcp_endpoints: vec!["127.0.0.1:0".parse().unwrap()],
            udp_endpoints: vec!["127.0.0.1:0".parse().unwrap()],
            session_options: SessionOptions::default(),
            tracking_options: TrackingOptions::default(),
            server_secret: "00".repeat(16),
            config_code: "test-config".into(),
            configure_interval_secs: 1,
        });

        let server = Server::new(access as Arc<dyn AccessManager>, Uuid::new_v4());
        server.start().await.unwrap();
        let addr = server.bound_tcp_endpoints()[0];
        (server, addr)
    }

    fn hello_for(token: &crate::token::Token, client_id: Uuid) -> Request {
        Request::Hello(HelloRequest {
            request_id: "req-hello".into(),
            token_id: token.token_id,
            client_info: ClientInfo {
                client_id,
                protocol_version: crate::PROTOCOL_VERSION,
                client_version: "test".into(),
                user_agent: "test".into(),
            },
            encrypted_client_id: hex::encode(encrypt_client_id(client_id, &token.secret).unwrap()),
        })
    }

    #[tokio::test]
    async fn test_hello_happy_path() {
        let access = Arc::new(InMemoryAccessManager::new());
        let token = access.create_token(Vec::new(), TokenOptions::default());
        let (server, addr) = started_server(Arc::clone(&access)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(&mut stream, &hello_for(&token, Uuid::new_v4()))
            .await
            .unwrap();
        let response: HelloResponse = wire::read_message(&mut stream).await.unwrap();

        assert_eq!(response.response.error_code, ErrorCode::Ok);
        assert_ne!(response.session_id, 0);
        assert_eq!(response.session_key.len(), 32);
        assert_eq!(response.tcp_endpoints, vec![addr]);
        assert_eq!(server.session_manager().session_count(), 1);
        assert_eq!(server.state(), ServerState::Ready);
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let access = Arc::new(InMemoryAccessManager::new());
        let (_server, addr) = started_server(access).await;

        // A token the manager never issued.
        let bogus = crate::token::Token {
            token_id: Uuid::new_v4(),
            secret: vec![1u8; 16],
            host_name: "x".into(),
            host_endpoints: vec![addr],
            cert_hash: None,
            refresh_url: None,
            protocol_version: crate::PROTOCOL_VERSION,
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(&mut stream, &hello_for(&bogus, Uuid::new_v4()))
            .await
            .unwrap();
        let response: HelloResponse = wire::read_message(&mut stream).await.unwrap();
        assert_eq!(response.response.error_code, ErrorCode::AccessError);
        assert_eq!(response.session_id, 0);
    }

    #[tokio::test]
    async fn test_udp_packet_request_reserved() {
        let access = Arc::new(InMemoryAccessManager::new());
        let token = access.create_token(Vec::new(), TokenOptions::default());
        let (_server, addr) = started_server(Arc::clone(&access)).await;

        // Create a session first.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(&mut stream, &hello_for(&token, Uuid::new_v4()))
            .await
            .unwrap();
        let hello: HelloResponse = wire::read_message(&mut stream).await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(
            &mut stream,
            &Request::UdpPacket(SessionRequest {
                request_id: "req-udp".into(),
                session_id: hello.session_id,
                session_key: hello.session_key.clone(),
            }),
        )
        .await
        .unwrap();

        let response: SessionResponse = wire::read_message(&mut stream).await.unwrap();
        assert_eq!(response.error_code, ErrorCode::GeneralError);
    }

    #[tokio::test]
    async fn test_bye_closes_session() {
        let access = Arc::new(InMemoryAccessManager::new());
        let token = access.create_token(Vec::new(), TokenOptions::default());
        let (server, addr) = started_server(Arc::clone(&access)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(&mut stream, &hello_for(&token, Uuid::new_v4()))
            .await
            .unwrap();
        let hello: HelloResponse = wire::read_message(&mut stream).await.unwrap();
        assert_eq!(server.session_manager().session_count(), 1);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        wire::write_message(
            &mut stream,
            &Request::Bye(SessionRequest {
                request_id: "req-bye".into(),
                session_id: hello.session_id,
                session_key: hello.session_key,
            }),
        )
        .await
        .unwrap();

        // Bye is fire-and-forget; wait for the server side to process it.
        for _ in 0..50 {
            if server.session_manager().session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.session_manager().session_count(), 0);
    }
}
