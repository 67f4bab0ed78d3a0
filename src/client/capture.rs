//! Packet capture capability interface.
//!
//! Each platform (user-mode divert driver, mobile VPN service) implements
//! this narrow surface; the client core depends on nothing else. Capture
//! delivery is a pull: the core awaits [`PacketCapture::recv`] and treats
//! `None` as "capture stopped".

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::error::Result;
use crate::packet::IpPacket;

/// Platform packet-capture surface.
#[async_trait]
pub trait PacketCapture: Send + Sync {
    /// Begin delivering packets.
    fn start(&self) -> Result<()>;

    /// Stop delivering packets; `recv` returns `None` afterwards.
    fn stop(&self);

    /// Next batch of packets captured from the device.
    async fn recv(&self) -> Option<Vec<IpPacket>>;

    /// Inject packets toward the device.
    fn send_inbound(&self, packets: &[IpPacket]) -> Result<()>;

    /// Whether the platform can emit packets straight to the network,
    /// bypassing the tunnel (pass-through).
    fn can_send_outbound(&self) -> bool {
        false
    }

    /// Emit packets straight to the network; only meaningful when
    /// [`PacketCapture::can_send_outbound`] is true.
    fn send_outbound(&self, _packets: &[IpPacket]) -> Result<()> {
        Err(crate::error::Error::config(
            "platform cannot send outbound directly",
        ))
    }

    /// DNS servers configured on the capture, when the platform exposes them.
    fn dns_servers(&self) -> Option<Vec<IpAddr>> {
        None
    }

    /// Networks the capture grabs; empty means everything.
    fn include_networks(&self) -> Vec<IpNet> {
        Vec::new()
    }

    /// MTU of the capture device, when known.
    fn mtu(&self) -> Option<usize> {
        None
    }
}

/// In-memory capture for tests and loopback runs: packets are fed in by
/// hand and injected packets are collected on a channel.
pub struct ChannelCapture {
    outbound_tx: tokio::sync::mpsc::Sender<Vec<IpPacket>>,
    outbound_rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Vec<IpPacket>>>,
    inbound_tx: tokio::sync::mpsc::Sender<Vec<IpPacket>>,
    stopped: std::sync::atomic::AtomicBool,
}

impl ChannelCapture {
    /// Create a capture; the returned receiver yields injected packets.
    pub fn new() -> (Self, tokio::sync::mpsc::Receiver<Vec<IpPacket>>) {
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(100);
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(100);
        (
            Self {
                outbound_tx,
                outbound_rx: tokio::sync::Mutex::new(outbound_rx),
                inbound_tx,
                stopped: std::sync::atomic::AtomicBool::new(false),
            },
            inbound_rx,
        )
    }

    /// Feed a captured packet into the core.
    pub async fn capture(&self, packets: Vec<IpPacket>) {
        let _ = self.outbound_tx.send(packets).await;
    }
}

#[async_trait]
impl PacketCapture for ChannelCapture {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::Release);
    }

    async fn recv(&self) -> Option<Vec<IpPacket>> {
        if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
            return None;
        }
        self.outbound_rx.lock().await.recv().await
    }

    fn send_inbound(&self, packets: &[IpPacket]) -> Result<()> {
        let _ = self.inbound_tx.try_send(packets.to_vec());
        Ok(())
    }
}
