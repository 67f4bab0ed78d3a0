//! Client core.
//!
//! Mirrors the server session on the device side: captures host packets,
//! classifies them, and forwards them into the tunnel or a local handler.
//! TCP flows headed for the tunnel are bent to a loopback catcher whose
//! accepted connections become StreamProxyChannel requests; DNS is always
//! tunneled, optionally rewritten to an upstream resolver through the NAT
//! table so replies come back transparently.

pub mod capture;

pub use capture::{ChannelCapture, PacketCapture};

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::crypto::encrypt_client_id;
use crate::error::{Error, ErrorCode, Result};
use crate::nat::NatTable;
use crate::packet::{IpPacket, Protocol, DNS_PORT};
use crate::token::Token;
use crate::tunnel::{
    ReceivedPackets, StreamDatagramChannel, StreamProxyChannel, Tunnel, TunnelConfig, UdpChannel,
};
use crate::util::TimeoutMap;
use crate::wire::{
    self, ClientInfo, HelloRequest, HelloResponse, Request, SessionRequest, SessionResponse,
    SessionStatus, StreamProxyRequest,
};

/// How often the client reconciles its datagram channels.
const CHANNEL_UPKEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Idle lifetime of a catcher flow entry.
const CATCHER_FLOW_TIMEOUT: Duration = Duration::from_secs(600);

/// Client configuration.
pub struct ClientConfig {
    /// Access token
    pub token: Token,
    /// Stable client id
    pub client_id: Uuid,
    /// Prefer the UDP channel over stream datagram channels
    pub use_udp_channel: bool,
    /// Drop all non-DNS UDP instead of tunneling or passing it through
    pub drop_udp: bool,
    /// Upstream resolver when the platform exposes no DNS configuration
    pub dns_upstream: Option<IpAddr>,
    /// Version string reported in Hello
    pub client_version: String,
    /// User agent reported in Hello
    pub user_agent: String,
}

impl ClientConfig {
    /// Config with defaults for everything but the token.
    pub fn new(token: Token) -> Self {
        Self {
            token,
            client_id: Uuid::new_v4(),
            use_udp_channel: false,
            drop_udp: false,
            dns_upstream: None,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            user_agent: format!("slipgate/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

struct HelloState {
    session_id: u64,
    session_key: [u8; 16],
    server_endpoint: SocketAddr,
    udp_endpoint: Option<SocketAddr>,
    max_datagram_channels: usize,
}

/// The client-side engine for one connection to a server.
pub struct VpnClient {
    config: Mutex<ClientConfig>,
    use_udp_channel: AtomicBool,
    capture: Arc<dyn PacketCapture>,
    tunnel: Arc<Tunnel>,
    nat: NatTable,
    hello: Mutex<Option<Arc<HelloState>>>,
    include_networks: Mutex<Vec<IpNet>>,
    catcher_flows: TimeoutMap<SocketAddr, SocketAddr>,
    catcher_addr: Mutex<Option<SocketAddr>>,
    status: Mutex<SessionStatus>,
    channel_permit: Semaphore,
    disposed: AtomicBool,
}

impl VpnClient {
    /// Create a client over a packet capture. Call [`VpnClient::connect`]
    /// to establish the session.
    pub fn new(config: ClientConfig, capture: Arc<dyn PacketCapture>) -> Arc<Self> {
        let use_udp = config.use_udp_channel;
        let (tunnel, tunnel_rx) = Tunnel::new(TunnelConfig::default());
        let client = Arc::new(Self {
            include_networks: Mutex::new(capture.include_networks()),
            config: Mutex::new(config),
            use_udp_channel: AtomicBool::new(use_udp),
            capture,
            tunnel,
            nat: NatTable::default(),
            hello: Mutex::new(None),
            catcher_flows: TimeoutMap::new(CATCHER_FLOW_TIMEOUT),
            catcher_addr: Mutex::new(None),
            status: Mutex::new(SessionStatus::default()),
            channel_permit: Semaphore::new(1),
            disposed: AtomicBool::new(false),
        });
        tokio::spawn(Arc::clone(&client).run_tunnel_rx(tunnel_rx));
        client
    }

    /// Session status as last reported by the server.
    pub fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    /// Tunnel handle.
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// Session id after a successful Hello, 0 before.
    pub fn session_id(&self) -> u64 {
        self.hello.lock().as_ref().map(|h| h.session_id).unwrap_or(0)
    }

    /// Whether the client was disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Switch between the UDP channel and stream datagram channels; the
    /// upkeep task reconciles on its next tick.
    pub fn set_use_udp_channel(&self, on: bool) {
        self.use_udp_channel.store(on, Ordering::Release);
    }

    /// Establish the session: Hello (following one redirect), the loopback
    /// catcher, the background loops, then packet capture.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let endpoint = *self
            .config
            .lock()
            .token
            .host_endpoints
            .first()
            .ok_or_else(|| Error::config("token has no host endpoints"))?;

        let response = self.send_hello(endpoint).await?;

        // One redirect hop is followed; a second redirect is a fault.
        let (response, endpoint) = if response.response.error_code == ErrorCode::RedirectHost {
            let target = response
                .response
                .redirect_host_endpoint
                .ok_or_else(|| Error::invalid("redirect without endpoint"))?;
            tracing::info!(%target, "redirected");
            let second = self.send_hello(target).await?;
            if second.response.error_code == ErrorCode::RedirectHost {
                return Err(Error::session(
                    ErrorCode::RedirectHost,
                    "server redirected twice",
                ));
            }
            (second, target)
        } else {
            (response, endpoint)
        };

        if response.response.error_code != ErrorCode::Ok {
            let mut status = self.status.lock();
            status.error_code = response.response.error_code;
            status.error_message = response.response.error_message.clone();
            return Err(Error::session(
                response.response.error_code,
                response
                    .response
                    .error_message
                    .unwrap_or_else(|| "hello rejected".into()),
            ));
        }

        let session_key: [u8; 16] = hex::decode(&response.session_key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| Error::invalid("malformed session key"))?;

        *self.hello.lock() = Some(Arc::new(HelloState {
            session_id: response.session_id,
            session_key,
            server_endpoint: endpoint,
            udp_endpoint: response.udp_endpoints.first().copied(),
            max_datagram_channels: response.max_datagram_channel_count.max(1),
        }));
        {
            let mut status = self.status.lock();
            status.access_usage = response.response.access_usage;
        }

        // Server-side narrowing of the capture ranges intersects ours.
        if let Some(ranges) = &response.packet_capture_include_ip_ranges {
            let parsed: Vec<IpNet> = ranges.iter().filter_map(|r| r.parse().ok()).collect();
            if !parsed.is_empty() {
                let mut networks = self.include_networks.lock();
                if networks.is_empty() {
                    *networks = parsed;
                } else {
                    networks.retain(|net| parsed.iter().any(|p| p.contains(&net.network())));
                }
            }
        }

        // Loopback catcher for redirected TCP flows.
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        *self.catcher_addr.lock() = Some(listener.local_addr()?);
        tokio::spawn(Arc::clone(self).run_catcher(listener));

        tokio::spawn(Arc::clone(self).run_capture_loop());
        tokio::spawn(Arc::clone(self).run_channel_upkeep());

        self.capture.start()?;
        tracing::info!(session_id = response.session_id, %endpoint, "connected");
        Ok(())
    }

    async fn send_hello(&self, endpoint: SocketAddr) -> Result<HelloResponse> {
        let (token_id, encrypted, client_info) = {
            let config = self.config.lock();
            (
                config.token.token_id,
                encrypt_client_id(config.client_id, &config.token.secret)?,
                ClientInfo {
                    client_id: config.client_id,
                    protocol_version: crate::PROTOCOL_VERSION,
                    client_version: config.client_version.clone(),
                    user_agent: config.user_agent.clone(),
                },
            )
        };

        let mut stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        let request = Request::Hello(HelloRequest {
            request_id: crate::crypto::SecureRandom::short_id(),
            token_id,
            client_info,
            encrypted_client_id: hex::encode(encrypted),
        });
        wire::write_message(&mut stream, &request).await?;
        wire::read_message(&mut stream).await
    }

    fn hello_state(&self) -> Result<Arc<HelloState>> {
        self.hello
            .lock()
            .clone()
            .ok_or_else(|| Error::session(ErrorCode::SessionError, "not connected"))
    }

    fn session_request(&self, hello: &HelloState) -> SessionRequest {
        SessionRequest {
            request_id: crate::crypto::SecureRandom::short_id(),
            session_id: hello.session_id,
            session_key: hex::encode(hello.session_key),
        }
    }

    /// Apply a server response's status fields; fatal codes dispose.
    fn absorb_response(&self, response: &SessionResponse) {
        let fatal = {
            let mut status = self.status.lock();
            status.access_usage = response.access_usage;
            status.suppressed_by = response.suppressed_by;
            if response.error_code != ErrorCode::Ok && status.error_code == ErrorCode::Ok {
                status.error_code = response.error_code;
                status.error_message = response.error_message.clone();
            }
            response.error_code.is_fatal()
        };
        if fatal {
            tracing::warn!(code = ?response.error_code, "server ended the session");
            self.dispose();
        }
    }

    // -- outbound classification ------------------------------------------

    async fn run_capture_loop(self: Arc<Self>) {
        while let Some(packets) = self.capture.recv().await {
            if self.is_disposed() {
                break;
            }
            for packet in packets {
                if let Err(e) = self.classify_outbound(packet).await {
                    tracing::debug!("outbound packet dropped: {e}");
                }
            }
        }
        tracing::debug!("capture stopped");
    }

    fn in_range(&self, addr: IpAddr) -> bool {
        let networks = self.include_networks.lock();
        networks.is_empty() || networks.iter().any(|net| net.contains(&addr))
    }

    async fn classify_outbound(&self, mut packet: IpPacket) -> Result<()> {
        // Neighbor/router discovery has no business in a tunnel.
        if packet.is_ipv6_discovery() {
            return Ok(());
        }

        match packet.protocol() {
            Protocol::Udp if packet.is_dns() => {
                // DNS always tunnels; rewrite toward the upstream when the
                // platform gave us no resolver of its own.
                let upstream = if self.capture.dns_servers().is_none() {
                    self.config.lock().dns_upstream
                } else {
                    None
                };
                if let Some(upstream) = upstream {
                    let item = self.nat.get_or_add(&packet)?;
                    packet.rewrite_source(packet.src_addr(), item.replacement_id)?;
                    packet.rewrite_destination(upstream, DNS_PORT)?;
                }
                self.tunnel.send_packet(packet).await
            }
            Protocol::Tcp => self.handle_tcp_outbound(packet),
            Protocol::Icmp | Protocol::IcmpV6 if packet.is_icmp_echo_request() => {
                self.tunnel.send_packet(packet).await
            }
            Protocol::Udp => {
                if self.config.lock().drop_udp {
                    return Ok(());
                }
                if self.in_range(packet.dst_addr()) {
                    self.tunnel.send_packet(packet).await
                } else if self.capture.can_send_outbound() {
                    self.capture.send_outbound(std::slice::from_ref(&packet))
                } else {
                    tracing::trace!("udp out of range, dropped");
                    Ok(())
                }
            }
            _ => {
                if self.capture.can_send_outbound() && !self.in_range(packet.dst_addr()) {
                    self.capture.send_outbound(std::slice::from_ref(&packet))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Bend in-range TCP to the loopback catcher; reverse the bend for the
    /// catcher's replies.
    fn handle_tcp_outbound(&self, mut packet: IpPacket) -> Result<()> {
        let catcher = (*self.catcher_addr.lock())
            .ok_or_else(|| Error::session(ErrorCode::SessionError, "catcher not running"))?;
        let src = packet
            .src_endpoint()
            .ok_or_else(|| Error::Packet("tcp without ports".into()))?;
        let dst = packet
            .dst_endpoint()
            .ok_or_else(|| Error::Packet("tcp without ports".into()))?;

        if src.ip() == catcher.ip() && src.port() == catcher.port() {
            // Reply leg: restore the original destination as the source.
            let original = self
                .catcher_flows
                .get(&dst)
                .ok_or_else(|| Error::Packet("no catcher flow for reply".into()))?;
            packet.rewrite_source(original.ip(), original.port())?;
            return self.capture.send_inbound(std::slice::from_ref(&packet));
        }

        if !self.in_range(dst.ip()) {
            if self.capture.can_send_outbound() {
                return self.capture.send_outbound(std::slice::from_ref(&packet));
            }
            return Ok(());
        }

        // Forward leg: remember the flow, point the packet at the catcher
        // and hand it back to the device so the OS connects locally.
        self.catcher_flows.insert(src, dst);
        packet.rewrite_destination(catcher.ip(), catcher.port())?;
        self.capture.send_inbound(std::slice::from_ref(&packet))
    }

    // -- catcher ----------------------------------------------------------

    async fn run_catcher(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (app_stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!("catcher accept: {e}");
                    break;
                }
            };
            if self.is_disposed() {
                break;
            }
            let Some(destination) = self.catcher_flows.get(&peer) else {
                tracing::debug!(%peer, "catcher connection without a flow");
                continue;
            };
            let client = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = client.open_stream_proxy(app_stream, destination).await {
                    tracing::debug!(%destination, "stream proxy failed: {e}");
                }
            });
        }
    }

    /// Open a StreamProxyChannel for one caught TCP connection.
    async fn open_stream_proxy(
        self: Arc<Self>,
        app_stream: TcpStream,
        destination: SocketAddr,
    ) -> Result<()> {
        let hello = self.hello_state()?;

        let mut server_stream = TcpStream::connect(hello.server_endpoint).await?;
        server_stream.set_nodelay(true)?;
        let request = Request::StreamProxyChannel(StreamProxyRequest {
            session: self.session_request(&hello),
            destination,
        });
        wire::write_message(&mut server_stream, &request).await?;
        let response: SessionResponse = wire::read_message(&mut server_stream).await?;
        self.absorb_response(&response);
        if response.error_code != ErrorCode::Ok {
            return Err(Error::session(
                response.error_code,
                response.error_message.unwrap_or_default(),
            ));
        }

        let channel = StreamProxyChannel::new(StreamProxyChannel::DEFAULT_MAX_CHUNK);
        self.tunnel.add_stream_proxy_channel(Arc::clone(&channel))?;
        channel.run(server_stream, app_stream).await;
        Ok(())
    }

    // -- inbound ----------------------------------------------------------

    async fn run_tunnel_rx(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<ReceivedPackets>) {
        while let Some(received) = rx.recv().await {
            if self.is_disposed() {
                break;
            }
            let mut inbound = Vec::with_capacity(received.packets.len());
            for mut packet in received.packets {
                if let Err(e) = self.restore_dns_reply(&mut packet) {
                    tracing::debug!("inbound packet dropped: {e}");
                    continue;
                }
                inbound.push(packet);
            }
            if !inbound.is_empty() {
                if let Err(e) = self.capture.send_inbound(&inbound) {
                    tracing::debug!("send_inbound failed: {e}");
                }
            }
        }
    }

    /// Undo the DNS upstream rewrite for replies, when one was applied.
    fn restore_dns_reply(&self, packet: &mut IpPacket) -> Result<()> {
        if packet.protocol() != Protocol::Udp || packet.source_id() != Some(DNS_PORT) {
            return Ok(());
        }
        let Some(dst_id) = packet.dest_id() else {
            return Ok(());
        };
        let version = packet.version();
        let Some(item) = self.nat.resolve(version, Protocol::Udp, dst_id) else {
            // Not one of ours; deliver untouched.
            return Ok(());
        };
        packet.rewrite_source(item.dst_addr, item.dst_id)?;
        packet.rewrite_destination(item.src_addr, item.src_id)?;
        Ok(())
    }

    // -- datagram channel upkeep ------------------------------------------

    async fn run_channel_upkeep(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(CHANNEL_UPKEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.is_disposed() {
                break;
            }
            if let Err(e) = self.reconcile_channels().await {
                tracing::debug!("channel upkeep: {e}");
            }
            self.nat.sweep();
            self.catcher_flows.sweep();
        }
    }

    /// Make the tunnel's channel set match the configured mode.
    async fn reconcile_channels(self: &Arc<Self>) -> Result<()> {
        let hello = self.hello_state()?;
        let want_udp = self.use_udp_channel.load(Ordering::Acquire);

        // Single permit: only one add proceeds at a time.
        let Ok(_permit) = self.channel_permit.try_acquire() else {
            return Ok(());
        };

        if want_udp {
            let have_udp = self.tunnel.datagram_channel_kind()
                == Some(crate::tunnel::ChannelKind::Udp)
                && self.tunnel.datagram_channel_count() == 1;
            if have_udp {
                return Ok(());
            }
            let udp_endpoint = hello
                .udp_endpoint
                .ok_or_else(|| Error::config("server offers no udp endpoint"))?;
            let socket = UdpSocket::bind(if udp_endpoint.is_ipv4() {
                "0.0.0.0:0"
            } else {
                "[::]:0"
            })
            .await?;
            socket.connect(udp_endpoint).await?;
            let channel =
                UdpChannel::new_client(socket, hello.session_id, &hello.session_key);
            self.tunnel.add_datagram_channel(channel)?;
            tracing::debug!("udp channel established");
        } else {
            let have = self.tunnel.datagram_channel_count();
            let kind = self.tunnel.datagram_channel_kind();
            let needs_stream = have == 0 || kind == Some(crate::tunnel::ChannelKind::Udp);
            if !needs_stream || have >= hello.max_datagram_channels {
                return Ok(());
            }

            let mut stream = TcpStream::connect(hello.server_endpoint).await?;
            stream.set_nodelay(true)?;
            let request = Request::TcpDatagramChannel(self.session_request(&hello));
            wire::write_message(&mut stream, &request).await?;
            let response: SessionResponse = wire::read_message(&mut stream).await?;
            self.absorb_response(&response);
            if response.error_code != ErrorCode::Ok {
                return Err(Error::session(
                    response.error_code,
                    response.error_message.unwrap_or_default(),
                ));
            }

            let channel = StreamDatagramChannel::new(stream, None);
            self.tunnel.add_datagram_channel(channel)?;
            tracing::debug!("stream datagram channel established");
        }
        Ok(())
    }

    // -- teardown ---------------------------------------------------------

    /// Graceful goodbye: tell the server, then tear down.
    pub async fn bye(self: &Arc<Self>) {
        if let Ok(hello) = self.hello_state() {
            let farewell = async {
                let mut stream = TcpStream::connect(hello.server_endpoint).await?;
                let request = Request::Bye(self.session_request(&hello));
                wire::write_message(&mut stream, &request).await?;
                let _: SessionResponse = wire::read_message(&mut stream).await?;
                Ok::<_, Error>(())
            };
            if let Err(e) = tokio::time::timeout(Duration::from_secs(5), farewell)
                .await
                .unwrap_or_else(|_| Err(Error::Timeout(5000)))
            {
                tracing::debug!("bye failed: {e}");
            }
        }
        self.dispose();
    }

    /// Immediate teardown; idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.capture.stop();
        self.tunnel.dispose();
        {
            let mut status = self.status.lock();
            if status.error_code == ErrorCode::Ok {
                status.error_code = ErrorCode::SessionClosed;
            }
        }
        tracing::info!("client disposed");
    }

    /// NAT table handle, for tests.
    #[cfg(test)]
    pub(crate) fn nat(&self) -> &NatTable {
        &self.nat
    }
}
