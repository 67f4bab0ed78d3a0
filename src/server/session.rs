//! Server-side session.
//!
//! A session owns the tunnel and the proxy pools for one client, enforces
//! the per-request limits, accounts traffic and periodically syncs usage to
//! the access manager. Fatal sync results dispose the session.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::access::{AccessManager, SessionOptions, TrackingOptions};
use crate::error::{Error, ErrorCode, Result};
use crate::packet::{IpPacket, Protocol};
use crate::proxy::{EndpointEvent, EndpointHook, PingProxyPool, ProxyPoolConfig, UdpProxyPoolEx};
use crate::server::netfilter::{NetFilter, NetScanDetector};
use crate::tunnel::{
    ReceivedPackets, StreamDatagramChannel, StreamProxyChannel, Tunnel, TunnelConfig, UdpChannel,
};
use crate::util::{EventReporter, Traffic};
use crate::wire::{SessionStatus, SuppressType};

/// Everything a session needs at birth.
pub struct SessionParams {
    /// Session id issued by the access manager
    pub session_id: u64,
    /// Session key issued by the access manager
    pub session_key: [u8; 16],
    /// Shared access manager
    pub access: Arc<dyn AccessManager>,
    /// Session knobs from the server config
    pub options: SessionOptions,
    /// Logging toggles from the server config
    pub tracking: TrackingOptions,
    /// Destination policy shared across sessions
    pub netfilter: Arc<NetFilter>,
    /// Host endpoint the client connected to
    pub host_endpoint: SocketAddr,
    /// Client IP, when tracking permits storing it
    pub client_ip: Option<IpAddr>,
    /// Server-side UDP channel transport, when the server has a UDP endpoint
    pub udp_transport: Option<(
        Arc<tokio::net::UdpSocket>,
        mpsc::Receiver<(Bytes, SocketAddr)>,
    )>,
}

/// One live client session on the server.
pub struct Session {
    session_id: u64,
    session_key: [u8; 16],
    access: Arc<dyn AccessManager>,
    options: SessionOptions,
    tracking: TrackingOptions,
    tunnel: Arc<Tunnel>,
    udp_pool: Arc<UdpProxyPoolEx>,
    ping_pool: Arc<PingProxyPool>,
    netfilter: Arc<NetFilter>,
    netscan: NetScanDetector,
    status: Mutex<SessionStatus>,
    synced_traffic: Mutex<Traffic>,
    last_sync: Mutex<std::time::Instant>,
    sync_lock: AsyncMutex<()>,
    pending_tcp_connects: AtomicUsize,
    request_gate: Mutex<()>,
    filter_reporter: EventReporter,
    host_endpoint: SocketAddr,
    client_ip: Option<IpAddr>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Session {
    /// Build the session and start its worker tasks.
    pub fn new(params: SessionParams) -> Arc<Self> {
        let tunnel_config = TunnelConfig {
            max_datagram_channels: params.options.max_datagram_channels,
            ..TunnelConfig::default()
        };
        let (tunnel, tunnel_rx) = Tunnel::new(tunnel_config);

        let (reply_tx, reply_rx) = mpsc::channel::<IpPacket>(100);

        let pool_config = ProxyPoolConfig::default();
        let session_id = params.session_id;
        let track_ip = params.tracking.track_client_ip;
        let endpoint_hook: EndpointHook = Arc::new(move |event| {
            if let EndpointEvent::NewRemote { destination, .. } = event {
                if track_ip {
                    tracing::debug!(session_id, %destination, "new remote endpoint");
                } else {
                    tracing::debug!(session_id, "new remote endpoint");
                }
            }
        });
        let udp_pool = UdpProxyPoolEx::new(
            pool_config.clone(),
            reply_tx.clone(),
            Some(Arc::clone(&endpoint_hook)),
        );
        let ping_pool = PingProxyPool::new(pool_config, reply_tx, Some(endpoint_hook));

        let session = Arc::new(Self {
            session_id: params.session_id,
            session_key: params.session_key,
            access: params.access,
            netscan: NetScanDetector::new(
                params.options.net_scan_limit,
                Duration::from_secs(params.options.net_scan_window_secs),
            ),
            options: params.options,
            tracking: params.tracking,
            tunnel: Arc::clone(&tunnel),
            udp_pool,
            ping_pool,
            netfilter: params.netfilter,
            status: Mutex::new(SessionStatus::default()),
            synced_traffic: Mutex::new(Traffic::default()),
            last_sync: Mutex::new(std::time::Instant::now()),
            sync_lock: AsyncMutex::new(()),
            pending_tcp_connects: AtomicUsize::new(0),
            request_gate: Mutex::new(()),
            filter_reporter: EventReporter::with_default_interval("request blocked"),
            host_endpoint: params.host_endpoint,
            client_ip: params.client_ip,
            disposed: AtomicBool::new(false),
        });

        // The UDP channel exists from birth when the server exposes a UDP
        // endpoint; a stream-datagram request later displaces it.
        if let Some((socket, inbox)) = params.udp_transport {
            let channel =
                UdpChannel::new_server(socket, inbox, session.session_id, &session.session_key);
            if let Err(e) = tunnel.add_datagram_channel(channel) {
                tracing::warn!(session_id = session.session_id, "udp channel add failed: {e}");
            }
        }

        tokio::spawn(Arc::clone(&session).route_tunnel_packets(tunnel_rx));
        tokio::spawn(Arc::clone(&session).forward_proxy_replies(reply_rx));
        tokio::spawn(Arc::clone(&session).run_sync_loop());
        session
    }

    /// Session id.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Tunnel handle.
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// Current status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    /// Whether the session was disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// How long since the tunnel last moved traffic.
    pub fn idle_for(&self) -> Duration {
        self.tunnel.last_activity().elapsed()
    }

    /// Check a request's proof of session ownership.
    pub fn verify_key(&self, session_key_hex: &str) -> Result<()> {
        let presented = hex::decode(session_key_hex).unwrap_or_default();
        if presented.as_slice() != self.session_key {
            return Err(Error::session(
                ErrorCode::Unauthorized,
                "session key mismatch",
            ));
        }
        Ok(())
    }

    /// Adopt a control stream as a stream-datagram channel.
    ///
    /// The mutual-exclusion rule in the tunnel displaces any UDP channel, so
    /// this doubles as `use_udp_channel = false`.
    pub fn add_stream_datagram_channel<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_disposed() {
            return Err(Error::session(ErrorCode::SessionClosed, "session disposed"));
        }
        let channel = StreamDatagramChannel::new(stream, None);
        self.tunnel.add_datagram_channel(channel)
    }

    /// Run the ordered checks for a StreamProxyChannel request and open the
    /// outbound connection.
    pub async fn connect_stream_proxy(&self, destination: SocketAddr) -> Result<TcpStream> {
        if self.is_disposed() {
            return Err(Error::session(ErrorCode::SessionClosed, "session disposed"));
        }

        // The checks run in a fixed order, atomically against each other.
        let mapped = {
            let _gate = self.request_gate.lock();

            let Some(mapped) = self.netfilter.process(destination) else {
                self.filter_reporter.raise(&format!("{destination}"));
                return Err(Error::session(
                    ErrorCode::RequestBlocked,
                    format!("destination {destination} blocked"),
                ));
            };

            if !self.netscan.verify(Protocol::Tcp, mapped) {
                return Err(Error::session(
                    ErrorCode::NetScan,
                    "too many new endpoints in window",
                ));
            }

            if self.tunnel.stream_proxy_channel_count() >= self.options.max_tcp_channels {
                return Err(Error::session(
                    ErrorCode::MaxTcpChannel,
                    "tcp channel quota reached",
                ));
            }

            if self.pending_tcp_connects.load(Ordering::Acquire)
                >= self.options.max_tcp_connect_wait
            {
                return Err(Error::session(
                    ErrorCode::MaxTcpConnectWait,
                    "too many connects in flight",
                ));
            }

            self.pending_tcp_connects.fetch_add(1, Ordering::AcqRel);
            mapped
        };

        let connect = tokio::time::timeout(
            Duration::from_millis(self.options.tcp_connect_timeout_ms),
            TcpStream::connect(mapped),
        )
        .await;
        self.pending_tcp_connects.fetch_sub(1, Ordering::AcqRel);

        let stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::Network(e)),
            Err(_) => return Err(Error::Timeout(self.options.tcp_connect_timeout_ms)),
        };

        self.apply_socket_options(&stream);
        if self.tracking.track_local_port {
            if let Ok(local) = stream.local_addr() {
                tracing::debug!(session_id = self.session_id, %local, %mapped, "proxy connect");
            }
        }
        Ok(stream)
    }

    fn apply_socket_options(&self, stream: &TcpStream) {
        let sock = socket2::SockRef::from(stream);
        if let Err(e) = sock.set_keepalive(true) {
            tracing::trace!("keepalive: {e}");
        }
        if self.options.tcp_buffer_size > 0 {
            if let Err(e) = sock.set_recv_buffer_size(self.options.tcp_buffer_size) {
                tracing::trace!("rcvbuf: {e}");
            }
            if let Err(e) = sock.set_send_buffer_size(self.options.tcp_buffer_size) {
                tracing::trace!("sndbuf: {e}");
            }
        }
    }

    /// Wire a request stream and a connected host stream into the tunnel.
    pub fn start_stream_proxy<A, B>(&self, tunnel_stream: A, host_stream: B) -> Result<()>
    where
        A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let channel = StreamProxyChannel::new(StreamProxyChannel::DEFAULT_MAX_CHUNK);
        self.tunnel.add_stream_proxy_channel(Arc::clone(&channel))?;
        tokio::spawn(channel.run(tunnel_stream, host_stream));
        Ok(())
    }

    /// Route packets the tunnel received from the client.
    async fn route_tunnel_packets(self: Arc<Self>, mut rx: mpsc::Receiver<ReceivedPackets>) {
        while let Some(received) = rx.recv().await {
            if self.is_disposed() {
                break;
            }
            for packet in received.packets {
                if let Err(e) = self.route_packet(&packet).await {
                    tracing::debug!(session_id = self.session_id, "packet dropped: {e}");
                }
            }
        }
    }

    async fn route_packet(&self, packet: &IpPacket) -> Result<()> {
        match packet.protocol() {
            Protocol::Udp => {
                let destination = packet
                    .dst_endpoint()
                    .ok_or_else(|| Error::Packet("udp without ports".into()))?;
                if self.netfilter.process(destination).is_none() {
                    self.filter_reporter.raise(&format!("{destination}"));
                    return Err(Error::session(
                        ErrorCode::RequestBlocked,
                        format!("udp to {destination} blocked"),
                    ));
                }
                if !self.netscan.verify(Protocol::Udp, destination) {
                    return Err(Error::session(ErrorCode::NetScan, "udp endpoint sweep"));
                }
                self.udp_pool.send_packet(packet).await
            }
            Protocol::Icmp if packet.is_icmp_echo_request() => {
                self.ping_pool.send_packet(packet).await
            }
            other => Err(Error::Packet(format!("unroutable protocol {other:?}"))),
        }
    }

    /// Push proxy replies back through the tunnel.
    async fn forward_proxy_replies(self: Arc<Self>, mut rx: mpsc::Receiver<IpPacket>) {
        while let Some(packet) = rx.recv().await {
            if self.is_disposed() {
                break;
            }
            if let Err(e) = self.tunnel.send_packet(packet).await {
                tracing::debug!(session_id = self.session_id, "reply dropped: {e}");
                if matches!(e, Error::Disposed) {
                    break;
                }
            }
        }
    }

    /// Frequent tick; a full sync happens once per configured interval, the
    /// cache-size threshold reports heavy traffic between intervals.
    async fn run_sync_loop(self: Arc<Self>) {
        let sync_interval = Duration::from_secs(self.options.sync_interval_secs.max(1));
        let mut ticker = tokio::time::interval(sync_interval.min(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.is_disposed() {
                break;
            }
            let interval_due = self.last_sync.lock().elapsed() >= sync_interval;
            if let Err(e) = self.sync(interval_due, false).await {
                // Transport trouble: keep serving, retry next tick.
                tracing::debug!(session_id = self.session_id, "usage sync failed: {e}");
            }
            self.udp_pool.sweep();
            self.ping_pool.sweep();
        }
    }

    /// Sync usage to the access manager.
    ///
    /// The delta is the tunnel traffic with axes swapped: what the tunnel
    /// sent is what the client received. Skipped while the delta is small
    /// unless forced or closing. Concurrent calls collapse onto one
    /// in-flight RPC behind the sync lock.
    pub async fn sync(&self, force: bool, closing: bool) -> Result<()> {
        let _guard = self.sync_lock.lock().await;

        let total = self.tunnel.traffic().swapped();
        let synced = *self.synced_traffic.lock();
        let delta = total - synced;

        if !force && !closing && delta.total() < self.options.sync_cache_size {
            return Ok(());
        }

        let response = self.access.add_usage(self.session_id, delta, closing).await;
        *self.last_sync.lock() = std::time::Instant::now();

        match response {
            Ok(response) => {
                *self.synced_traffic.lock() = total;
                let fatal = {
                    let mut status = self.status.lock();
                    status.access_usage = response.access_usage;
                    status.suppressed_by = response.suppressed_by;
                    if response.error_code != ErrorCode::Ok && status.error_code == ErrorCode::Ok {
                        status.error_code = response.error_code;
                        status.error_message = response.error_message.clone();
                    }
                    status.error_code != ErrorCode::Ok
                };
                if fatal {
                    tracing::info!(
                        session_id = self.session_id,
                        code = ?self.status.lock().error_code,
                        "access manager ended session"
                    );
                    self.dispose();
                }
                Ok(())
            }
            Err(Error::NotFound(_)) => {
                {
                    let mut status = self.status.lock();
                    status.error_code = ErrorCode::AccessError;
                    status.error_message = Some("session not found by access manager".into());
                }
                self.dispose();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Graceful close: final usage delta, then teardown.
    pub async fn close(&self, code: ErrorCode) {
        {
            let mut status = self.status.lock();
            if status.error_code == ErrorCode::Ok {
                status.error_code = code;
            }
        }
        if let Err(e) = self.sync(true, true).await {
            tracing::debug!(session_id = self.session_id, "final sync failed: {e}");
        }
        self.dispose();
    }

    /// Immediate teardown; idempotent. After this nothing is delivered.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut status = self.status.lock();
            if status.error_code == ErrorCode::Ok {
                status.error_code = ErrorCode::SessionClosed;
            }
        }
        self.tunnel.dispose();
        tracing::info!(session_id = self.session_id, "session disposed");
    }

    /// Suppression marker for status responses.
    pub fn suppressed_by(&self) -> SuppressType {
        self.status.lock().suppressed_by
    }

    /// Client address, when tracked.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    /// Host endpoint this session came in on.
    pub fn host_endpoint(&self) -> SocketAddr {
        self.host_endpoint
    }
}
