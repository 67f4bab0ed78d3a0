//! UDP proxying between tunneled packets and native sockets.
//!
//! Two pool shapes share the same surface:
//!
//! - [`UdpProxyPool`] keys workers by tunneled source endpoint; every source
//!   gets a dedicated socket. Simple and isolating, but port-hungry.
//! - [`UdpProxyPoolEx`] keys flows by (source, destination) and lets one
//!   socket serve many destinations as long as no destination is claimed by
//!   two sources; replies stay unambiguous because the worker's
//!   destination → source map has a single owner per destination.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};

use crate::error::{Error, ErrorCode, Result};
use crate::packet::{self, IpPacket, Protocol};
use crate::proxy::{EndpointEvent, EndpointHook, ProxyPoolConfig};
use crate::util::{EventReporter, TimeoutMap};

/// Bind an ephemeral socket in the family of `addr`.
async fn bind_ephemeral(addr: IpAddr) -> Result<UdpSocket> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    Ok(UdpSocket::bind(bind_addr).await?)
}

// ---------------------------------------------------------------------------
// Simple pool: one worker per tunneled source endpoint
// ---------------------------------------------------------------------------

struct UdpWorker {
    socket: Arc<UdpSocket>,
    closed: Notify,
    dead: AtomicBool,
}

impl UdpWorker {
    fn close(&self) {
        self.dead.store(true, Ordering::Release);
        self.closed.notify_waiters();
    }
}

/// Per-source UDP proxy pool.
pub struct UdpProxyPool {
    workers: TimeoutMap<SocketAddr, Arc<UdpWorker>>,
    reply_tx: mpsc::Sender<IpPacket>,
    config: ProxyPoolConfig,
    hook: Option<EndpointHook>,
    seen_remotes: DashSet<SocketAddr>,
    max_workers_reporter: EventReporter,
}

impl UdpProxyPool {
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
            seen_remotes: DashSet::new(),
            max_workers_reporter: EventReporter::with_default_interval("udp worker quota"),
        })
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Forward one tunneled UDP packet to its destination.
    pub async fn send_packet(self: &Arc<Self>, packet: &IpPacket) -> Result<()> {
        let source = packet
            .src_endpoint()
            .ok_or_else(|| Error::Packet("udp proxy needs a udp packet".into()))?;
        let destination = packet
            .dst_endpoint()
            .ok_or_else(|| Error::Packet("udp proxy needs a udp packet".into()))?;
        let payload = packet
            .udp_payload()
            .ok_or_else(|| Error::Packet("udp payload missing".into()))?;

        let worker = match self.workers.get(&source) {
            Some(worker) => worker,
            None => self.create_worker(source).await?,
        };

        self.note_remote(destination);
        worker.socket.send_to(payload, destination).await?;
        Ok(())
    }

    async fn create_worker(self: &Arc<Self>, source: SocketAddr) -> Result<Arc<UdpWorker>> {
        if self.workers.len() >= self.config.max_clients {
            self.max_workers_reporter
                .raise(&format!("{} workers", self.workers.len()));
            return Err(Error::session(
                ErrorCode::UdpClientQuota,
                "udp client quota reached",
            ));
        }

        let socket = Arc::new(bind_ephemeral(source.ip()).await?);
        let local = socket.local_addr()?;
        let worker = Arc::new(UdpWorker {
            socket: Arc::clone(&socket),
            closed: Notify::new(),
            dead: AtomicBool::new(false),
        });
        self.workers.insert(source, Arc::clone(&worker));

        if let Some(hook) = &self.hook {
            hook(EndpointEvent::NewLocal {
                protocol: Protocol::Udp,
                local,
            });
        }
        tracing::debug!(%source, %local, "udp worker created");

        tokio::spawn(Self::run_worker(
            Arc::clone(&worker),
            source,
            self.reply_tx.clone(),
        ));
        Ok(worker)
    }

    /// Reply loop: wrap datagrams from the socket back into IP packets
    /// addressed to the original tunneled source.
    async fn run_worker(worker: Arc<UdpWorker>, source: SocketAddr, reply_tx: mpsc::Sender<IpPacket>) {
        let mut buf = vec![0u8; 0x10000];
        loop {
            let (n, from) = tokio::select! {
                _ = worker.closed.notified() => break,
                received = worker.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!("udp worker recv: {e}");
                        break;
                    }
                },
            };

            match packet::build_udp(from, source, &buf[..n]) {
                Ok(reply) => {
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!("udp reply build failed: {e}"),
            }
        }
        worker.close();
    }

    fn note_remote(&self, destination: SocketAddr) {
        if self.seen_remotes.insert(destination) {
            if let Some(hook) = &self.hook {
                hook(EndpointEvent::NewRemote {
                    protocol: Protocol::Udp,
                    destination,
                });
            }
        }
    }

    /// Evict idle workers; the owner drives this from its maintenance tick.
    pub fn sweep(&self) {
        for (source, worker) in self.workers.sweep() {
            tracing::debug!(%source, "udp worker idle, closing");
            worker.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Port-efficient pool: sockets shared across destinations
// ---------------------------------------------------------------------------

struct UdpWorkerEx {
    socket: Arc<UdpSocket>,
    /// destination → tunneled source; single owner per destination.
    destinations: TimeoutMap<SocketAddr, SocketAddr>,
    closed: Notify,
    dead: AtomicBool,
}

impl UdpWorkerEx {
    fn close(&self) {
        self.dead.store(true, Ordering::Release);
        self.closed.notify_waiters();
    }
}

/// Port-efficient UDP proxy pool keyed by (source, destination).
pub struct UdpProxyPoolEx {
    /// flow → worker assignment, idle-expiring.
    flows: TimeoutMap<(SocketAddr, SocketAddr), Arc<UdpWorkerEx>>,
    workers: Mutex<Vec<Arc<UdpWorkerEx>>>,
    reply_tx: mpsc::Sender<IpPacket>,
    config: ProxyPoolConfig,
    hook: Option<EndpointHook>,
    seen_remotes: DashSet<SocketAddr>,
    max_workers_reporter: EventReporter,
}

impl UdpProxyPoolEx {
    /// Create a pool; replies surface on `reply_tx` as ready-to-tunnel packets.
    pub fn new(
        config: ProxyPoolConfig,
        reply_tx: mpsc::Sender<IpPacket>,
        hook: Option<EndpointHook>,
    ) -> Arc<Self> {
        Arc::new(Self {
            flows: TimeoutMap::new(config.idle_timeout),
            workers: Mutex::new(Vec::new()),
            reply_tx,
            config,
            hook,
            seen_remotes: DashSet::new(),
            max_workers_reporter: EventReporter::with_default_interval("udp local endpoint quota"),
        })
    }

    /// Number of live local sockets.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Forward one tunneled UDP packet to its destination.
    pub async fn send_packet(self: &Arc<Self>, packet: &IpPacket) -> Result<()> {
        let source = packet
            .src_endpoint()
            .ok_or_else(|| Error::Packet("udp proxy needs a udp packet".into()))?;
        let destination = packet
            .dst_endpoint()
            .ok_or_else(|| Error::Packet("udp proxy needs a udp packet".into()))?;
        let payload = packet
            .udp_payload()
            .ok_or_else(|| Error::Packet("udp payload missing".into()))?;

        let worker = match self.flows.get(&(source, destination)) {
            Some(worker) => worker,
            None => self.assign_worker(source, destination).await?,
        };

        self.note_remote(destination);
        let _ = worker.destinations.get(&destination); // refresh the route's idle timer
        worker.socket.send_to(payload, destination).await?;
        Ok(())
    }

    /// Pick the first worker that can still take this destination, or open a
    /// new socket.
    async fn assign_worker(
        self: &Arc<Self>,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Result<Arc<UdpWorkerEx>> {
        {
            let workers = self.workers.lock();
            for worker in workers.iter() {
                if worker.dead.load(Ordering::Acquire) {
                    continue;
                }
                // A destination already claimed by another source would make
                // replies ambiguous on this socket.
                if worker.destinations.peek(&destination).is_none() {
                    worker.destinations.insert(destination, source);
                    self.flows.insert((source, destination), Arc::clone(worker));
                    return Ok(Arc::clone(worker));
                }
            }
            if workers.len() >= self.config.max_local_endpoints {
                self.max_workers_reporter
                    .raise(&format!("{} sockets", workers.len()));
                return Err(Error::session(
                    ErrorCode::UdpClientQuota,
                    "udp local endpoint quota reached",
                ));
            }
        }

        let socket = Arc::new(bind_ephemeral(source.ip()).await?);
        let local = socket.local_addr()?;
        let worker = Arc::new(UdpWorkerEx {
            socket: Arc::clone(&socket),
            destinations: TimeoutMap::new(self.config.idle_timeout),
            closed: Notify::new(),
            dead: AtomicBool::new(false),
        });
        worker.destinations.insert(destination, source);
        self.workers.lock().push(Arc::clone(&worker));
        self.flows.insert((source, destination), Arc::clone(&worker));

        if let Some(hook) = &self.hook {
            hook(EndpointEvent::NewLocal {
                protocol: Protocol::Udp,
                local,
            });
        }
        tracing::debug!(%local, "udp ex worker created");

        tokio::spawn(Self::run_worker(Arc::clone(&worker), self.reply_tx.clone()));
        Ok(worker)
    }

    /// Reply loop: route each datagram to the source that owns its remote.
    async fn run_worker(worker: Arc<UdpWorkerEx>, reply_tx: mpsc::Sender<IpPacket>) {
        let mut buf = vec![0u8; 0x10000];
        loop {
            let (n, from) = tokio::select! {
                _ = worker.closed.notified() => break,
                received = worker.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::debug!("udp ex worker recv: {e}");
                        break;
                    }
                },
            };

            let Some(source) = worker.destinations.get(&from) else {
                tracing::trace!(%from, "datagram from unmapped remote, dropping");
                continue;
            };

            match packet::build_udp(from, source, &buf[..n]) {
                Ok(reply) => {
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!("udp reply build failed: {e}"),
            }
        }
        worker.close();
    }

    fn note_remote(&self, destination: SocketAddr) {
        if self.seen_remotes.insert(destination) {
            if let Some(hook) = &self.hook {
                hook(EndpointEvent::NewRemote {
                    protocol: Protocol::Udp,
                    destination,
                });
            }
        }
    }

    /// Expire idle flows and close workers with no destinations left.
    pub fn sweep(&self) {
        self.flows.sweep();
        let mut workers = self.workers.lock();
        workers.retain(|worker| {
            worker.destinations.sweep();
            let keep = !worker.destinations.is_empty() && !worker.dead.load(Ordering::Acquire);
            if !keep {
                worker.close();
            }
            keep
        });
    }
}
