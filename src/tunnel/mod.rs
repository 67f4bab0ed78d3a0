//! Packet tunnel: fan-in/out of IP packets across datagram channels.
//!
//! The tunnel owns a bounded FIFO of outbound packets and one sender worker
//! per datagram channel. Workers drain MTU-respecting batches; received
//! payloads funnel through one ingress task that filters in-band control
//! envelopes and hands IP packets to the single consumer (the session or the
//! client core) over a bounded mpsc.

mod channel;

pub use channel::{
    ChannelBatch, ChannelKind, DatagramChannel, StreamDatagramChannel, StreamProxyChannel,
    UdpChannel,
};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify, Semaphore};

use crate::error::{Error, ErrorCode, Result};
use crate::packet::{self, IpPacket, IpVersion};
use crate::util::Traffic;
use crate::wire::DatagramMessage;

/// Tunnel tuning knobs.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Cap on simultaneous datagram channels
    pub max_datagram_channels: usize,
    /// Largest packet sent inside a batch; bigger DF'd IPv4 triggers MTU discovery
    pub mtu_no_fragment: usize,
    /// Absolute largest packet carried at all
    pub mtu_with_fragment: usize,
    /// Outbound queue capacity
    pub queue_capacity: usize,
    /// How long a producer waits on a full queue before failing
    pub datagram_timeout: Duration,
    /// Speed sampling period
    pub speed_interval: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_datagram_channels: 8,
            mtu_no_fragment: 1500,
            // Coarse clamp, tunable; oversized-but-fragmentable packets
            // up to this size still travel alone.
            mtu_with_fragment: 0x2000,
            queue_capacity: 100,
            datagram_timeout: Duration::from_secs(100),
            speed_interval: Duration::from_secs(2),
        }
    }
}

/// Packets delivered by the tunnel to its consumer.
#[derive(Debug)]
pub struct ReceivedPackets {
    /// Parsed IP packets
    pub packets: Vec<IpPacket>,
    /// Channel they arrived on
    pub channel_id: String,
}

struct ChannelSet {
    datagram: Vec<Arc<dyn DatagramChannel>>,
    stream_proxies: Vec<Arc<StreamProxyChannel>>,
}

/// Multiplexed packet tunnel for one session.
pub struct Tunnel {
    config: TunnelConfig,
    channels: Mutex<ChannelSet>,
    queue: Mutex<VecDeque<IpPacket>>,
    /// Signaled (with permits) when the queue may hold work for senders.
    packets_available: Semaphore,
    /// Signaled when queue slots free up, waking blocked producers.
    packet_sent: Notify,
    ingress_tx: mpsc::Sender<ChannelBatch>,
    output_tx: mpsc::Sender<ReceivedPackets>,
    removed_traffic: Mutex<Traffic>,
    speed: Mutex<Traffic>,
    last_activity: Mutex<Instant>,
    disposed: AtomicBool,
    dispose_notify: Notify,
}

impl Tunnel {
    /// Create a tunnel; the returned receiver yields everything the tunnel
    /// receives from its channels.
    pub fn new(config: TunnelConfig) -> (Arc<Self>, mpsc::Receiver<ReceivedPackets>) {
        let (ingress_tx, ingress_rx) = mpsc::channel(config.queue_capacity);
        let (output_tx, output_rx) = mpsc::channel(config.queue_capacity);

        let tunnel = Arc::new(Self {
            config,
            channels: Mutex::new(ChannelSet {
                datagram: Vec::new(),
                stream_proxies: Vec::new(),
            }),
            queue: Mutex::new(VecDeque::new()),
            packets_available: Semaphore::new(0),
            packet_sent: Notify::new(),
            ingress_tx,
            output_tx,
            removed_traffic: Mutex::new(Traffic::default()),
            speed: Mutex::new(Traffic::default()),
            last_activity: Mutex::new(Instant::now()),
            disposed: AtomicBool::new(false),
            dispose_notify: Notify::new(),
        });

        tokio::spawn(Self::run_ingress(Arc::downgrade(&tunnel), ingress_rx));
        tokio::spawn(Self::run_speed_sampler(Arc::downgrade(&tunnel)));
        (tunnel, output_rx)
    }

    /// Tunnel with default configuration.
    pub fn with_defaults() -> (Arc<Self>, mpsc::Receiver<ReceivedPackets>) {
        Self::new(TunnelConfig::default())
    }

    /// Whether [`Tunnel::dispose`] ran.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Live datagram channel count.
    pub fn datagram_channel_count(&self) -> usize {
        self.channels.lock().datagram.len()
    }

    /// Live stream proxy channel count.
    pub fn stream_proxy_channel_count(&self) -> usize {
        self.channels.lock().stream_proxies.len()
    }

    /// Kind of the current datagram channels, if any.
    pub fn datagram_channel_kind(&self) -> Option<ChannelKind> {
        self.channels.lock().datagram.first().map(|c| c.kind())
    }

    /// Total bytes moved: live channels plus everything already removed.
    pub fn traffic(&self) -> Traffic {
        let channels = self.channels.lock();
        let mut total = *self.removed_traffic.lock();
        for c in &channels.datagram {
            total += c.traffic();
        }
        for c in &channels.stream_proxies {
            total += c.traffic();
        }
        total
    }

    /// Bytes per second over the last sampling period.
    pub fn speed(&self) -> Traffic {
        *self.speed.lock()
    }

    /// Last time traffic actually moved.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Add a datagram channel, enforcing kind exclusion and the count cap.
    pub fn add_datagram_channel(
        self: &Arc<Self>,
        channel: Arc<dyn DatagramChannel>,
    ) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        {
            let mut channels = self.channels.lock();
            let mut removed = self.removed_traffic.lock();

            // UDP and stream datagram channels never coexist; the newcomer's
            // kind wins and evicts the others.
            if channels
                .datagram
                .first()
                .is_some_and(|c| c.kind() != channel.kind())
            {
                for old in channels.datagram.drain(..) {
                    tracing::debug!(channel = old.id(), "evicting datagram channel (kind switch)");
                    old.close();
                    *removed += old.traffic();
                }
            }

            channels.datagram.push(Arc::clone(&channel));

            while channels.datagram.len() > self.config.max_datagram_channels {
                let oldest = channels.datagram.remove(0);
                tracing::debug!(channel = oldest.id(), "evicting oldest datagram channel");
                oldest.close();
                *removed += oldest.traffic();
            }
        }

        tracing::debug!(channel = channel.id(), kind = ?channel.kind(), "datagram channel added");

        // Receiver task; on exit the channel is gone for good.
        let tunnel = Arc::downgrade(self);
        let receiver_channel = Arc::clone(&channel);
        let ingress = self.ingress_tx.clone();
        tokio::spawn(async move {
            let id = receiver_channel.id().to_string();
            receiver_channel.run_receiver(ingress).await;
            if let Some(tunnel) = tunnel.upgrade() {
                tunnel.remove_channel(&id);
            }
        });

        // Sender worker.
        tokio::spawn(Arc::clone(self).run_sender_worker(channel));

        // Let the new worker look at whatever is already queued.
        self.packets_available.add_permits(1);
        Ok(())
    }

    /// Track a stream proxy channel for accounting. Duplicate ids are an
    /// error; the caller runs the pump itself.
    pub fn add_stream_proxy_channel(&self, channel: Arc<StreamProxyChannel>) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let mut channels = self.channels.lock();
        if channels.stream_proxies.iter().any(|c| c.id() == channel.id()) {
            return Err(Error::invalid(format!(
                "stream proxy channel {} already tracked",
                channel.id()
            )));
        }
        channels.stream_proxies.push(channel);
        Ok(())
    }

    /// Remove a channel by id; unknown ids are a no-op.
    pub fn remove_channel(&self, id: &str) {
        let mut channels = self.channels.lock();
        let mut removed = self.removed_traffic.lock();

        if let Some(pos) = channels.datagram.iter().position(|c| c.id() == id) {
            let channel = channels.datagram.remove(pos);
            channel.close();
            *removed += channel.traffic();
            tracing::debug!(channel = id, "datagram channel removed");
        }
        if let Some(pos) = channels.stream_proxies.iter().position(|c| c.id() == id) {
            let channel = channels.stream_proxies.remove(pos);
            channel.close();
            *removed += channel.traffic();
            tracing::debug!(channel = id, "stream proxy channel removed");
        }
    }

    /// Send one packet.
    pub async fn send_packet(&self, packet: IpPacket) -> Result<()> {
        self.send_packets(vec![packet]).await
    }

    /// Enqueue packets for the sender workers.
    ///
    /// Blocks while the queue is at capacity; fails with `TunnelCongested`
    /// when no slot frees within the datagram timeout.
    pub async fn send_packets(&self, packets: Vec<IpPacket>) -> Result<()> {
        let deadline = Instant::now() + self.config.datagram_timeout;

        for packet in packets {
            let mut pending = Some(packet);
            while let Some(packet) = pending.take() {
                if self.is_disposed() {
                    return Err(Error::Disposed);
                }
                {
                    let mut queue = self.queue.lock();
                    if queue.len() < self.config.queue_capacity {
                        queue.push_back(packet);
                        continue;
                    }
                }
                pending = Some(packet);

                if Instant::now() >= deadline {
                    return Err(Error::session(
                        ErrorCode::TunnelCongested,
                        "tunnel queue full past the datagram timeout",
                    ));
                }
                // Spin-wait: a freed slot wakes us early, otherwise re-check
                // every second until the deadline.
                tokio::select! {
                    _ = self.packet_sent.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = self.dispose_notify.notified() => {}
                }
            }

            let waker_permits = self.datagram_channel_count().max(1);
            self.packets_available.add_permits(waker_permits);
        }
        Ok(())
    }

    /// Drain a batch honoring the two MTUs. Returns the batch and any ICMP
    /// replies produced for dropped DF'd packets.
    fn drain_batch(&self) -> (Vec<IpPacket>, Vec<IpPacket>) {
        let mut batch = Vec::new();
        let mut replies = Vec::new();
        let mut batch_size = 0usize;
        let mut freed = 0usize;

        {
            let mut queue = self.queue.lock();
            loop {
                let (len, df_v4) = match queue.front() {
                    Some(front) => (
                        front.len(),
                        front.version() == IpVersion::V4 && front.dont_fragment(),
                    ),
                    None => break,
                };

                if len > self.config.mtu_with_fragment {
                    queue.pop_front();
                    freed += 1;
                    tracing::warn!(
                        len,
                        max = self.config.mtu_with_fragment,
                        "dropping packet above the absolute MTU"
                    );
                    continue;
                }

                if len > self.config.mtu_no_fragment && df_v4 {
                    if let Some(dropped) = queue.pop_front() {
                        freed += 1;
                        match packet::build_fragmentation_needed(
                            &dropped,
                            self.config.mtu_no_fragment as u16,
                        ) {
                            Ok(reply) => replies.push(reply),
                            Err(e) => tracing::debug!("fragmentation-needed build failed: {e}"),
                        }
                    }
                    continue;
                }

                if len > self.config.mtu_no_fragment {
                    // Oversized but fragmentable: flush the batch, then send
                    // this one alone.
                    if batch.is_empty() {
                        if let Some(oversized) = queue.pop_front() {
                            batch.push(oversized);
                            freed += 1;
                        }
                    }
                    break;
                }

                if batch_size + len > self.config.mtu_no_fragment && !batch.is_empty() {
                    break;
                }

                if let Some(next) = queue.pop_front() {
                    batch_size += len;
                    batch.push(next);
                    freed += 1;
                }
            }
        }

        if freed > 0 {
            self.packet_sent.notify_waiters();
        }
        (batch, replies)
    }

    async fn run_sender_worker(self: Arc<Self>, channel: Arc<dyn DatagramChannel>) {
        loop {
            tokio::select! {
                _ = self.dispose_notify.notified() => break,
                permit = self.packets_available.acquire() => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                },
            }
            if self.is_disposed() {
                break;
            }
            if !channel.is_connected() {
                self.remove_channel(channel.id());
                break;
            }

            let (batch, replies) = self.drain_batch();

            // MTU-discovery replies travel upstream like received packets.
            for reply in replies {
                let _ = self
                    .output_tx
                    .send(ReceivedPackets {
                        packets: vec![reply],
                        channel_id: channel.id().to_string(),
                    })
                    .await;
            }

            if batch.is_empty() {
                continue;
            }

            match channel.send_packets(&batch).await {
                Ok(()) => {
                    // One permit on each side lets siblings proceed.
                    self.packet_sent.notify_waiters();
                    self.packets_available.add_permits(1);
                }
                Err(e) => {
                    tracing::debug!(channel = channel.id(), "send failed, re-enqueueing: {e}");
                    if let Err(e) = self.send_packets(batch).await {
                        tracing::debug!("re-enqueue dropped batch: {e}");
                    }
                    if !channel.is_connected() {
                        self.remove_channel(channel.id());
                        break;
                    }
                }
            }
        }
    }

    async fn run_ingress(tunnel: Weak<Tunnel>, mut rx: mpsc::Receiver<ChannelBatch>) {
        while let Some(batch) = rx.recv().await {
            let Some(tunnel) = tunnel.upgrade() else { break };
            if tunnel.is_disposed() {
                break;
            }

            let mut packets = Vec::with_capacity(batch.payloads.len());
            for payload in batch.payloads {
                if DatagramMessage::matches(&payload) {
                    match DatagramMessage::decode(&payload) {
                        Ok(message) => {
                            tracing::debug!(?message, channel = %batch.channel_id, "control message")
                        }
                        Err(e) => tracing::debug!("bad control message: {e}"),
                    }
                    continue;
                }
                match IpPacket::new(payload.to_vec()) {
                    Ok(packet) => packets.push(packet),
                    // Per-packet errors are logged and swallowed.
                    Err(e) => tracing::debug!(channel = %batch.channel_id, "bad packet: {e}"),
                }
            }

            if !packets.is_empty()
                && tunnel
                    .output_tx
                    .send(ReceivedPackets {
                        packets,
                        channel_id: batch.channel_id,
                    })
                    .await
                    .is_err()
            {
                break;
            }
        }
    }

    async fn run_speed_sampler(tunnel: Weak<Tunnel>) {
        let interval = match tunnel.upgrade() {
            Some(t) => t.config.speed_interval,
            None => return,
        };
        let mut previous = Traffic::default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(tunnel) = tunnel.upgrade() else { break };
            if tunnel.is_disposed() {
                break;
            }

            tunnel.prune_dead_proxies();

            let current = tunnel.traffic();
            let delta = current - previous;
            let secs = interval.as_secs_f64();
            *tunnel.speed.lock() = Traffic::new(
                (delta.sent as f64 / secs) as u64,
                (delta.received as f64 / secs) as u64,
            );
            if delta.total() > 0 {
                *tunnel.last_activity.lock() = Instant::now();
            }
            previous = current;
        }
    }

    fn prune_dead_proxies(&self) {
        let mut channels = self.channels.lock();
        let mut removed = self.removed_traffic.lock();
        channels.stream_proxies.retain(|c| {
            if c.is_connected() {
                true
            } else {
                *removed += c.traffic();
                false
            }
        });
    }

    /// Tear the tunnel down. Idempotent; all channels close, workers exit,
    /// and any blocked producer is released.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let mut channels = self.channels.lock();
            let mut removed = self.removed_traffic.lock();
            for channel in channels.datagram.drain(..) {
                channel.close();
                *removed += channel.traffic();
            }
            for channel in channels.stream_proxies.drain(..) {
                channel.close();
                *removed += channel.traffic();
            }
        }

        self.dispose_notify.notify_waiters();
        self.packet_sent.notify_waiters();
        // Enough permits to shake every possible waiter loose.
        self.packets_available
            .add_permits(self.config.max_datagram_channels * 10 + 1);
        tracing::debug!("tunnel disposed");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_udp;

    fn small_packet(tag: u8) -> IpPacket {
        build_udp(
            "10.0.0.2:1000".parse().unwrap(),
            "198.18.0.1:2000".parse().unwrap(),
            &[tag; 16],
        )
        .unwrap()
    }

    fn paired_channels() -> (Arc<StreamDatagramChannel>, Arc<StreamDatagramChannel>) {
        let (a, b) = tokio::io::duplex(0x40000);
        (
            StreamDatagramChannel::new(a, None),
            StreamDatagramChannel::new(b, None),
        )
    }

    /// A tunnel with one stream channel wired to a peer tunnel's channel.
    async fn linked_tunnels() -> (
        Arc<Tunnel>,
        mpsc::Receiver<ReceivedPackets>,
        Arc<Tunnel>,
        mpsc::Receiver<ReceivedPackets>,
    ) {
        let (left, left_rx) = Tunnel::with_defaults();
        let (right, right_rx) = Tunnel::with_defaults();
        let (a, b) = paired_channels();
        left.add_datagram_channel(a).unwrap();
        right.add_datagram_channel(b).unwrap();
        (left, left_rx, right, right_rx)
    }

    #[tokio::test]
    async fn test_packets_flow_between_tunnels() {
        let (left, _left_rx, _right, mut right_rx) = linked_tunnels().await;

        left.send_packets(vec![small_packet(1), small_packet(2)])
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 2 {
            let batch = tokio::time::timeout(Duration::from_secs(5), right_rx.recv())
                .await
                .expect("packets must arrive")
                .unwrap();
            received.extend(batch.packets);
        }
        assert_eq!(received[0].udp_payload().unwrap(), &[1u8; 16]);
        assert_eq!(received[1].udp_payload().unwrap(), &[2u8; 16]);
    }

    #[tokio::test]
    async fn test_kind_switch_evicts_other_kind() {
        let (tunnel, _rx) = Tunnel::with_defaults();

        let (stream_a, _keep_a) = paired_channels();
        let (stream_b, _keep_b) = paired_channels();
        tunnel.add_datagram_channel(stream_a).unwrap();
        tunnel.add_datagram_channel(stream_b).unwrap();
        assert_eq!(tunnel.datagram_channel_count(), 2);

        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp = UdpChannel::new_client(socket, 1, &[0u8; 16]);
        tunnel.add_datagram_channel(udp).unwrap();

        assert_eq!(tunnel.datagram_channel_count(), 1);
        assert_eq!(tunnel.datagram_channel_kind(), Some(ChannelKind::Udp));

        // And back: a stream channel displaces the UDP one.
        let (stream_c, _keep_c) = paired_channels();
        tunnel.add_datagram_channel(stream_c).unwrap();
        assert_eq!(tunnel.datagram_channel_kind(), Some(ChannelKind::StreamDatagram));
        assert_eq!(tunnel.datagram_channel_count(), 1);
    }

    #[tokio::test]
    async fn test_max_channels_evicts_oldest() {
        let config = TunnelConfig {
            max_datagram_channels: 2,
            ..TunnelConfig::default()
        };
        let (tunnel, _rx) = Tunnel::new(config);

        let (first, _k1) = paired_channels();
        let first_id = first.id().to_string();
        let (second, _k2) = paired_channels();
        let (third, _k3) = paired_channels();

        tunnel.add_datagram_channel(first.clone()).unwrap();
        tunnel.add_datagram_channel(second).unwrap();
        tunnel.add_datagram_channel(third).unwrap();

        assert_eq!(tunnel.datagram_channel_count(), 2);
        assert!(!first.is_connected(), "oldest channel {first_id} must close");
    }

    #[tokio::test]
    async fn test_oversized_df_packet_yields_icmp_reply() {
        let config = TunnelConfig {
            mtu_no_fragment: 200,
            ..TunnelConfig::default()
        };
        let (tunnel, mut rx) = Tunnel::new(config);
        let (a, _b_keep) = paired_channels();
        tunnel.add_datagram_channel(a).unwrap();

        // build_udp leaves DF clear; set the flag on the raw buffer.
        let oversized = build_udp(
            "10.0.0.2:1000".parse().unwrap(),
            "198.18.0.1:2000".parse().unwrap(),
            &[0u8; 400],
        )
        .unwrap();
        let mut bytes = oversized.into_bytes();
        bytes[6] |= 0x40; // DF flag
        // Header checksum changes with the flag bits.
        {
            use smoltcp::wire::Ipv4Packet;
            let mut ip = Ipv4Packet::new_unchecked(&mut bytes[..]);
            ip.fill_checksum();
        }
        let packet = IpPacket::new(bytes).unwrap();
        assert!(packet.dont_fragment());

        tunnel.send_packet(packet).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("icmp reply expected")
            .unwrap();
        let reply = &batch.packets[0];
        let icmp = reply.icmp_bytes().unwrap();
        assert_eq!((icmp[0], icmp[1]), (3, 4));
        assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 200);
    }

    #[tokio::test]
    async fn test_queue_blocks_then_times_out() {
        let config = TunnelConfig {
            queue_capacity: 2,
            datagram_timeout: Duration::from_millis(50),
            ..TunnelConfig::default()
        };
        // No channels: nothing drains the queue.
        let (tunnel, _rx) = Tunnel::new(config);

        tunnel
            .send_packets(vec![small_packet(1), small_packet(2)])
            .await
            .unwrap();

        let err = tunnel.send_packet(small_packet(3)).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::TunnelCongested);
    }

    #[tokio::test]
    async fn test_traffic_monotonic_and_survives_removal() {
        let (left, _lrx, _right, mut right_rx) = linked_tunnels().await;

        left.send_packet(small_packet(9)).await.unwrap();
        right_rx.recv().await.unwrap();

        let before = left.traffic();
        assert!(before.sent > 0);

        // Removing the only channel folds its counters into the tunnel total.
        let id = {
            let channels = left.channels.lock();
            channels.datagram[0].id().to_string()
        };
        left.remove_channel(&id);
        assert_eq!(left.datagram_channel_count(), 0);
        let after = left.traffic();
        assert!(after.sent >= before.sent);
        assert!(after.received >= before.received);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_unblocks() {
        let (tunnel, _rx) = Tunnel::with_defaults();
        tunnel.dispose();
        tunnel.dispose();
        assert!(tunnel.is_disposed());

        let err = tunnel.send_packet(small_packet(1)).await.unwrap_err();
        assert!(matches!(err, Error::Disposed));

        let (channel, _keep) = paired_channels();
        assert!(tunnel.add_datagram_channel(channel).is_err());
    }

    #[tokio::test]
    async fn test_duplicate_stream_proxy_rejected() {
        let (tunnel, _rx) = Tunnel::with_defaults();
        let proxy = StreamProxyChannel::new(StreamProxyChannel::DEFAULT_MAX_CHUNK);
        tunnel.add_stream_proxy_channel(Arc::clone(&proxy)).unwrap();
        assert!(tunnel.add_stream_proxy_channel(proxy).is_err());
        assert_eq!(tunnel.stream_proxy_channel_count(), 1);
    }
}
