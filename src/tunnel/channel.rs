//! Tunnel channels.
//!
//! Three transports carry user traffic between the endpoints:
//!
//! - [`StreamDatagramChannel`]: length-framed packets over a reliable
//!   stream, with an optional bounded lifespan to rotate connections.
//! - [`UdpChannel`]: AEAD-sealed datagrams over raw UDP, one per tunnel.
//! - [`StreamProxyChannel`]: a byte pump between two streams, used for TCP
//!   passthrough; not a datagram channel.
//!
//! Datagram channels push received payloads into the tunnel through an mpsc
//! ingress rather than invoking callbacks, so cancellation is a dropped
//! receiver and nothing re-enters channel code.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

use crate::crypto::{expand_session_key, Aead, Nonce, SecureRandom, SESSION_KEY_SIZE};
use crate::error::{Error, Result};
use crate::packet::IpPacket;
use crate::util::{Traffic, TrafficMeter};
use crate::wire::{self, UdpDatagramHeader, UDP_FLAG_SERVER_TO_CLIENT, UDP_HEADER_SIZE};

/// Kind of a datagram channel; the tunnel never mixes the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Length-framed packets over a reliable stream
    StreamDatagram,
    /// Sealed datagrams over UDP
    Udp,
}

/// A batch of raw datagram payloads received on one channel.
#[derive(Debug)]
pub struct ChannelBatch {
    /// Which channel produced the batch
    pub channel_id: String,
    /// Raw payloads; IP packets and in-band control envelopes
    pub payloads: Vec<Bytes>,
}

/// A transport that can carry whole packets for one tunnel.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// Stable channel id.
    fn id(&self) -> &str;

    /// Stream or UDP.
    fn kind(&self) -> ChannelKind;

    /// Whether the channel is still usable.
    fn is_connected(&self) -> bool;

    /// Bytes moved through this channel.
    fn traffic(&self) -> Traffic;

    /// Tear the channel down; idempotent.
    fn close(&self);

    /// Send a batch of packets.
    async fn send_packets(&self, packets: &[IpPacket]) -> Result<()>;

    /// Receive until close/EOF/lifespan, pushing payload batches to `ingress`.
    async fn run_receiver(self: Arc<Self>, ingress: mpsc::Sender<ChannelBatch>);
}

// ---------------------------------------------------------------------------
// StreamDatagramChannel
// ---------------------------------------------------------------------------

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Length-framed datagram transport over a reliable stream (TCP/TLS).
pub struct StreamDatagramChannel {
    id: String,
    reader: AsyncMutex<Option<BoxedReader>>,
    writer: AsyncMutex<BoxedWriter>,
    meter: TrafficMeter,
    connected: AtomicBool,
    closed: Notify,
    lifespan: Option<Duration>,
}

impl StreamDatagramChannel {
    /// Wrap a stream. `lifespan` bounds pick a rotation deadline uniformly
    /// in `[min, max]`; `None` keeps the channel until it fails.
    pub fn new<S>(stream: S, lifespan: Option<(Duration, Duration)>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let lifespan = lifespan.map(|(min, max)| {
            let span = max.saturating_sub(min);
            if span.is_zero() {
                min
            } else {
                min + Duration::from_millis(SecureRandom::u64() % span.as_millis() as u64)
            }
        });

        Arc::new(Self {
            id: format!("sdc-{}", SecureRandom::short_id()),
            reader: AsyncMutex::new(Some(Box::new(read_half))),
            writer: AsyncMutex::new(Box::new(write_half)),
            meter: TrafficMeter::new(),
            connected: AtomicBool::new(true),
            closed: Notify::new(),
            lifespan,
        })
    }
}

#[async_trait]
impl DatagramChannel for StreamDatagramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::StreamDatagram
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn traffic(&self) -> Traffic {
        self.meter.snapshot()
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.closed.notify_waiters();
    }

    async fn send_packets(&self, packets: &[IpPacket]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disposed);
        }

        let mut buf = BytesMut::new();
        for packet in packets {
            wire::put_frame(&mut buf, packet.as_bytes())?;
        }

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await?;
            Ok::<_, Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.meter.add_sent(buf.len() as u64);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    async fn run_receiver(self: Arc<Self>, ingress: mpsc::Sender<ChannelBatch>) {
        let Some(mut reader) = self.reader.lock().await.take() else {
            return;
        };

        let deadline = self
            .lifespan
            .map(|d| tokio::time::Instant::now() + d)
            .unwrap_or_else(|| {
                tokio::time::Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
            });

        loop {
            tokio::select! {
                _ = self.closed.notified() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(channel = %self.id, "stream channel lifespan elapsed");
                    break;
                }
                frame = wire::read_frame(&mut reader) => match frame {
                    Ok(Some(payload)) => {
                        self.meter.add_received(2 + payload.len() as u64);
                        let batch = ChannelBatch {
                            channel_id: self.id.clone(),
                            payloads: vec![payload],
                        };
                        if ingress.send(batch).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(channel = %self.id, "stream channel read: {e}");
                        break;
                    }
                },
            }
        }
        self.close();
    }
}

// ---------------------------------------------------------------------------
// UdpChannel
// ---------------------------------------------------------------------------

enum UdpTransport {
    /// Client side: a socket connected to the server's UDP endpoint.
    Connected(Arc<UdpSocket>),
    /// Server side: the shared listener socket plus a per-session inbox fed
    /// by the dispatcher; the last peer address is where replies go.
    Dispatched {
        socket: Arc<UdpSocket>,
        peer: Mutex<Option<SocketAddr>>,
        inbox: AsyncMutex<Option<mpsc::Receiver<(Bytes, SocketAddr)>>>,
    },
}

/// AEAD-sealed datagram transport over raw UDP. One per tunnel.
pub struct UdpChannel {
    id: String,
    session_id: u64,
    aead: Aead,
    is_server: bool,
    transport: UdpTransport,
    send_seq: AtomicU64,
    meter: TrafficMeter,
    connected: AtomicBool,
    closed: Notify,
}

impl UdpChannel {
    /// Client-side channel over a connected socket.
    pub fn new_client(
        socket: UdpSocket,
        session_id: u64,
        session_key: &[u8; SESSION_KEY_SIZE],
    ) -> Arc<Self> {
        Self::new(
            UdpTransport::Connected(Arc::new(socket)),
            session_id,
            session_key,
            false,
        )
    }

    /// Server-side channel behind the shared UDP listener; `inbox` receives
    /// raw datagrams the dispatcher routed to this session.
    pub fn new_server(
        socket: Arc<UdpSocket>,
        inbox: mpsc::Receiver<(Bytes, SocketAddr)>,
        session_id: u64,
        session_key: &[u8; SESSION_KEY_SIZE],
    ) -> Arc<Self> {
        Self::new(
            UdpTransport::Dispatched {
                socket,
                peer: Mutex::new(None),
                inbox: AsyncMutex::new(Some(inbox)),
            },
            session_id,
            session_key,
            true,
        )
    }

    fn new(
        transport: UdpTransport,
        session_id: u64,
        session_key: &[u8; SESSION_KEY_SIZE],
        is_server: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: format!("udp-{}", SecureRandom::short_id()),
            session_id,
            aead: Aead::new(&expand_session_key(session_key)),
            is_server,
            transport,
            send_seq: AtomicU64::new(0),
            meter: TrafficMeter::new(),
            connected: AtomicBool::new(true),
            closed: Notify::new(),
        })
    }

    fn send_flags(&self) -> u8 {
        if self.is_server {
            UDP_FLAG_SERVER_TO_CLIENT
        } else {
            0
        }
    }

    /// Seal one packet into a wire datagram.
    pub fn seal_packet(&self, packet: &IpPacket) -> Result<Vec<u8>> {
        let header = UdpDatagramHeader {
            session_id: self.session_id,
            sequence: self.send_seq.fetch_add(1, Ordering::Relaxed),
            flags: self.send_flags(),
        };
        let header_bytes = header.encode();
        let nonce = Nonce::for_datagram(header.sequence, header.session_id, header.flags);
        let sealed = self.aead.encrypt(&nonce, packet.as_bytes(), &header_bytes)?;

        let mut datagram = Vec::with_capacity(UDP_HEADER_SIZE + sealed.len());
        datagram.extend_from_slice(&header_bytes);
        datagram.extend_from_slice(&sealed);
        Ok(datagram)
    }

    /// Open a wire datagram addressed to this channel.
    ///
    /// Out-of-order and duplicated datagrams are accepted; the IP layer above
    /// is idempotent about both.
    pub fn open_datagram(&self, datagram: &[u8]) -> Result<Bytes> {
        let header = UdpDatagramHeader::decode(datagram)?;
        if header.session_id != self.session_id {
            return Err(Error::invalid("datagram for another session"));
        }
        let expected_flags = if self.is_server {
            0
        } else {
            UDP_FLAG_SERVER_TO_CLIENT
        };
        if header.flags != expected_flags {
            return Err(Error::invalid("datagram direction mismatch"));
        }

        let nonce = Nonce::for_datagram(header.sequence, header.session_id, header.flags);
        let (header_bytes, sealed) = datagram.split_at(UDP_HEADER_SIZE);
        let payload = self.aead.decrypt(&nonce, sealed, header_bytes)?;
        Ok(Bytes::from(payload))
    }
}

#[async_trait]
impl DatagramChannel for UdpChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Udp
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn traffic(&self) -> Traffic {
        self.meter.snapshot()
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.closed.notify_waiters();
    }

    async fn send_packets(&self, packets: &[IpPacket]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disposed);
        }

        for packet in packets {
            let datagram = self.seal_packet(packet)?;
            let result = match &self.transport {
                UdpTransport::Connected(socket) => socket.send(&datagram).await,
                UdpTransport::Dispatched { socket, peer, .. } => {
                    let Some(peer) = *peer.lock() else {
                        // No datagram has arrived yet, so there is no return
                        // address; the client retransmits at the IP layer.
                        tracing::trace!(channel = %self.id, "udp peer unknown, dropping");
                        continue;
                    };
                    socket.send_to(&datagram, peer).await
                }
            };
            match result {
                Ok(sent) => self.meter.add_sent(sent as u64),
                Err(e) => {
                    // A connected socket surfaces ICMP errors here; treat the
                    // channel as gone so the tunnel replaces it.
                    self.close();
                    return Err(Error::Network(e));
                }
            }
        }
        Ok(())
    }

    async fn run_receiver(self: Arc<Self>, ingress: mpsc::Sender<ChannelBatch>) {
        match &self.transport {
            UdpTransport::Connected(socket) => {
                let socket = Arc::clone(socket);
                let mut buf = vec![0u8; 0x10000];
                loop {
                    tokio::select! {
                        _ = self.closed.notified() => break,
                        received = socket.recv(&mut buf) => match received {
                            Ok(n) => self.ingest(Bytes::copy_from_slice(&buf[..n]), &ingress).await,
                            Err(e) => {
                                tracing::debug!(channel = %self.id, "udp recv: {e}");
                                break;
                            }
                        },
                    }
                }
            }
            UdpTransport::Dispatched { inbox, peer, .. } => {
                let Some(mut inbox) = inbox.lock().await.take() else {
                    return;
                };
                loop {
                    tokio::select! {
                        _ = self.closed.notified() => break,
                        received = inbox.recv() => match received {
                            Some((datagram, from)) => {
                                *peer.lock() = Some(from);
                                self.ingest(datagram, &ingress).await;
                            }
                            None => break,
                        },
                    }
                }
            }
        }
        self.close();
    }
}

impl UdpChannel {
    async fn ingest(&self, datagram: Bytes, ingress: &mpsc::Sender<ChannelBatch>) {
        self.meter.add_received(datagram.len() as u64);
        match self.open_datagram(&datagram) {
            Ok(payload) => {
                let batch = ChannelBatch {
                    channel_id: self.id.clone(),
                    payloads: vec![payload],
                };
                let _ = ingress.send(batch).await;
            }
            Err(e) => {
                // Per-packet errors are logged and dropped.
                tracing::debug!(channel = %self.id, "udp datagram rejected: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StreamProxyChannel
// ---------------------------------------------------------------------------

/// Bidirectional byte pump between the tunnel-side stream and a host stream.
///
/// On the server the host stream is a freshly connected TCP client; on the
/// client it is the intercepted application stream.
pub struct StreamProxyChannel {
    id: String,
    meter: TrafficMeter,
    connected: AtomicBool,
    closed: Notify,
    max_chunk: usize,
}

impl StreamProxyChannel {
    /// Default per-read chunk cap.
    pub const DEFAULT_MAX_CHUNK: usize = 0x4000;

    /// Create a pump with the given chunk cap.
    pub fn new(max_chunk: usize) -> Arc<Self> {
        Arc::new(Self {
            id: format!("spc-{}", SecureRandom::short_id()),
            meter: TrafficMeter::new(),
            connected: AtomicBool::new(true),
            closed: Notify::new(),
            max_chunk: max_chunk.max(512),
        })
    }

    /// Stable channel id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bytes moved: `sent` toward the tunnel, `received` from it.
    pub fn traffic(&self) -> Traffic {
        self.meter.snapshot()
    }

    /// Whether the pump is still moving bytes.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Stop the pump; idempotent.
    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.closed.notify_waiters();
    }

    /// Copy bytes in both directions until either side closes or errors.
    pub async fn run<A, B>(self: Arc<Self>, tunnel_stream: A, host_stream: B)
    where
        A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (tunnel_read, tunnel_write) = tokio::io::split(tunnel_stream);
        let (host_read, host_write) = tokio::io::split(host_stream);

        let this = Arc::clone(&self);
        let from_tunnel = tokio::spawn(this.clone().pump(tunnel_read, host_write, false));
        let to_tunnel = tokio::spawn(this.pump(host_read, tunnel_write, true));

        let _ = tokio::join!(from_tunnel, to_tunnel);
        self.close();
        tracing::debug!(channel = %self.id, traffic = ?self.traffic(), "stream proxy finished");
    }

    async fn pump<R, W>(self: Arc<Self>, mut reader: R, mut writer: W, toward_tunnel: bool)
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let mut buf = vec![0u8; self.max_chunk];
        loop {
            let n = tokio::select! {
                _ = self.closed.notified() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            };
            if writer.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if toward_tunnel {
                self.meter.add_sent(n as u64);
            } else {
                self.meter.add_received(n as u64);
            }
        }
        // Half-close so the peer task drains and exits too.
        let _ = writer.shutdown().await;
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_udp;

    fn sample_packet() -> IpPacket {
        build_udp(
            "10.0.0.2:5000".parse().unwrap(),
            "198.18.0.1:6000".parse().unwrap(),
            b"payload",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_stream_channel_roundtrip() {
        let (a, b) = tokio::io::duplex(0x10000);
        let sender = StreamDatagramChannel::new(a, None);
        let receiver = StreamDatagramChannel::new(b, None);

        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(Arc::clone(&receiver).run_receiver(tx));

        let packet = sample_packet();
        sender.send_packets(std::slice::from_ref(&packet)).await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.channel_id, receiver.id());
        assert_eq!(batch.payloads.len(), 1);
        assert_eq!(&batch.payloads[0][..], packet.as_bytes());

        assert!(sender.traffic().sent > 0);
        assert_eq!(receiver.traffic().received, sender.traffic().sent);
    }

    #[tokio::test]
    async fn test_stream_channel_eof_disconnects() {
        let (a, b) = tokio::io::duplex(0x1000);
        let receiver = StreamDatagramChannel::new(b, None);

        let (tx, _rx) = mpsc::channel(16);
        let handle = tokio::spawn(Arc::clone(&receiver).run_receiver(tx));

        drop(a);
        handle.await.unwrap();
        assert!(!receiver.is_connected());
    }

    #[tokio::test]
    async fn test_stream_channel_lifespan_expires() {
        let (_a, b) = tokio::io::duplex(0x1000);
        let channel = StreamDatagramChannel::new(
            b,
            Some((Duration::from_millis(5), Duration::from_millis(10))),
        );

        let (tx, _rx) = mpsc::channel(16);
        let handle = tokio::spawn(Arc::clone(&channel).run_receiver(tx));

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("receiver must stop when the lifespan elapses")
            .unwrap();
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_udp_channel_roundtrip() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client_socket.connect(server_addr).await.unwrap();

        let key = [7u8; SESSION_KEY_SIZE];
        let client = UdpChannel::new_client(client_socket, 42, &key);

        let (inbox_tx, inbox_rx) = mpsc::channel(16);
        let server_socket = Arc::new(server_socket);
        let server = UdpChannel::new_server(Arc::clone(&server_socket), inbox_rx, 42, &key);

        // Feed the server inbox the way the listener dispatcher would.
        let dispatch_socket = Arc::clone(&server_socket);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 0x10000];
            let (n, from) = dispatch_socket.recv_from(&mut buf).await.unwrap();
            inbox_tx
                .send((Bytes::copy_from_slice(&buf[..n]), from))
                .await
                .unwrap();
        });

        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(Arc::clone(&server).run_receiver(tx));

        let packet = sample_packet();
        client.send_packets(std::slice::from_ref(&packet)).await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(&batch.payloads[0][..], packet.as_bytes());
    }

    #[tokio::test]
    async fn test_udp_channel_rejects_cross_session() {
        let key = [7u8; SESSION_KEY_SIZE];
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpChannel::new_client(socket, 42, &key);

        let datagram = client.seal_packet(&sample_packet()).unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let other_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let other = UdpChannel::new_server(other_socket, rx, 43, &key);
        assert!(other.open_datagram(&datagram).is_err());
    }

    #[tokio::test]
    async fn test_udp_channel_rejects_reflected_direction() {
        let key = [7u8; SESSION_KEY_SIZE];
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpChannel::new_client(socket, 42, &key);

        // A client must not accept its own client-to-server datagrams.
        let datagram = client.seal_packet(&sample_packet()).unwrap();
        assert!(client.open_datagram(&datagram).is_err());
    }

    #[tokio::test]
    async fn test_stream_proxy_copies_both_ways() {
        let (tunnel_near, tunnel_far) = tokio::io::duplex(0x1000);
        let (host_near, host_far) = tokio::io::duplex(0x1000);

        let proxy = StreamProxyChannel::new(StreamProxyChannel::DEFAULT_MAX_CHUNK);
        let run = tokio::spawn(Arc::clone(&proxy).run(tunnel_far, host_far));

        let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel_near);
        let (mut host_read, mut host_write) = tokio::io::split(host_near);

        tunnel_write.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        host_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        host_write.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        tunnel_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        drop(tunnel_write);
        drop(tunnel_read);
        run.await.unwrap();
        assert!(!proxy.is_connected());
        let traffic = proxy.traffic();
        assert_eq!(traffic.received, 7);
        assert_eq!(traffic.sent, 5);
    }
}
