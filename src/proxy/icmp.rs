//! Echo proxying over kernel ping sockets.
//!
//! Tunneled ICMP echo requests go out through unprivileged `IPPROTO_ICMP`
//! datagram sockets. The kernel owns the query id on such sockets, so one
//! worker is kept per (tunneled source, original id) and replies get their
//! original id written back before re-entering the tunnel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smoltcp::wire::Icmpv4Packet;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, ErrorCode, Result};
use crate::packet::{self, IpPacket, Protocol};
use crate::proxy::{EndpointEvent, EndpointHook, ProxyPoolConfig};
use crate::util::{EventReporter, TimeoutMap};

struct PingWorker {
    socket: Arc<UdpSocket>,
    closed: Notify,
    dead: AtomicBool,
}

impl PingWorker {
    fn close(&self) {
        self.dead.store(true, Ordering::Release);
        self.closed.notify_waiters();
    }
}

/// Pool of ping sockets, one per (tunneled source, echo id).
pub struct PingProxyPool {
    workers: TimeoutMap<(Ipv4Addr, u16), Arc<PingWorker>>,
    reply_tx: mpsc::Sender<IpPacket>,
    config: ProxyPoolConfig,
    hook: Option<EndpointHook>,
    max_workers_reporter: EventReporter,
}

impl PingProxyPool {
    /// Create a pool; replies surface on `reply_tx` as ready-to-tunnel packets.
    pub fn new(
        config: ProxyPoolConfig,
        reply_tx: mpsc::Sender<IpPacket>,
        hook: Option<EndpointHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers: TimeoutMap::new(config.idle_timeout),
            reply_tx,
            config,
            hook,
            max_workers_reporter: EventReporter::with_default_interval("ping worker quota"),
        })
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Forward one tunneled echo request.
    pub async fn send_packet(self: &Arc<Self>, packet: &IpPacket) -> Result<()> {
        if packet.protocol() != Protocol::Icmp {
            return Err(Error::Packet("ping proxy takes icmpv4 echo only".into()));
        }
        let (IpAddr::V4(source), IpAddr::V4(destination)) = (packet.src_addr(), packet.dst_addr())
        else {
            return Err(Error::Packet("ping proxy takes icmpv4 echo only".into()));
        };
        let ident = packet
            .source_id()
            .ok_or_else(|| Error::Packet("echo ident missing".into()))?;
        let message = packet
            .icmp_bytes()
            .ok_or_else(|| Error::Packet("icmp body missing".into()))?;

        let worker = match self.workers.get(&(source, ident)) {
            Some(worker) => worker,
            None => self.create_worker(source, ident).await?,
        };

        worker
            .socket
            .send_to(message, SocketAddr::new(IpAddr::V4(destination), 0))
            .await?;
        Ok(())
    }

    async fn create_worker(
        self: &Arc<Self>,
        source: Ipv4Addr,
        ident: u16,
    ) -> Result<Arc<PingWorker>> {
        if self.workers.len() >= self.config.max_clients {
            self.max_workers_reporter
                .raise(&format!("{} workers", self.workers.len()));
            return Err(Error::session(
                ErrorCode::UdpClientQuota,
                "ping worker quota reached",
            ));
        }

        let socket = Arc::new(ping_socket()?);
        let worker = Arc::new(PingWorker {
            socket: Arc::clone(&socket),
            closed: Notify::new(),
            dead: AtomicBool::new(false),
        });
        self.workers.insert((source, ident), Arc::clone(&worker));

        if let Some(hook) = &self.hook {
            if let Ok(local) = socket.local_addr() {
                hook(EndpointEvent::NewLocal {
                    protocol: Protocol::Icmp,
                    local,
                });
            }
        }
        tracing::debug!(%source, ident, "ping worker created");

        tokio::spawn(Self::run_worker(
            Arc::clone(&worker),
            source,
            ident,
            self.reply_tx.clone(),
        ));
        Ok(worker)
    }

    /// Reply loop: restore the original echo id and wrap the message back
    /// into an IP packet toward the tunneled source.
    async fn run_worker(
        worker: Arc<PingWorker>,
        source: Ipv4Addr,
        ident: u16,
        reply_tx: mpsc::Sender<IpPacket>,
    ) {
        let mut buf = vec![0u8; 0x10000];
        loop {
            let (n, from) = tokio::select! {
                _ = worker.closed.notified() => break,
                received = worker.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!("ping worker recv: {e}");
                        break;
                    }
                },
            };
            let IpAddr::V4(from) = from.ip() else { continue };

            let mut message = buf[..n].to_vec();
            match Icmpv4Packet::new_checked(&mut message[..]) {
                Ok(mut icmp)
                    if matches!(
                        icmp.msg_type(),
                        smoltcp::wire::Icmpv4Message::EchoReply
                            | smoltcp::wire::Icmpv4Message::EchoRequest
                    ) =>
                {
                    icmp.set_echo_ident(ident);
                    icmp.fill_checksum();
                }
                // Errors (unreachable, TTL) pass through with the kernel's
                // id; the tunneled host matches them on the quoted payload.
                Ok(_) => {}
                Err(_) => continue,
            }

            match packet::build_icmp_v4(from, source, &message) {
                Ok(reply) => {
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!("ping reply build failed: {e}"),
            }
        }
        worker.close();
    }

    /// Evict idle workers.
    pub fn sweep(&self) {
        for ((source, ident), worker) in self.workers.sweep() {
            tracing::debug!(%source, ident, "ping worker idle, closing");
            worker.close();
        }
    }
}

/// Open an unprivileged ICMP datagram socket registered with tokio.
fn ping_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::ICMPV4))?;
    socket.set_nonblocking(true)?;
    // The fd speaks ICMP, but it is datagram-shaped; tokio's UdpSocket
    // drives it fine.
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
