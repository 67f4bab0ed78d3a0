//! Per-destination NAT table.
//!
//! Outbound packets get their source id (UDP port, ICMP query id) replaced
//! with an allocated id unique within the (version, protocol) bucket; the
//! reverse map routes replies back to the original tunneled source. Entries
//! age out after an idle timeout.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::crypto::SecureRandom;
use crate::error::{Error, Result};
use crate::packet::{IpPacket, IpVersion, Protocol};

/// Default idle lifetime of a NAT item.
pub const DEFAULT_NAT_TIMEOUT: Duration = Duration::from_secs(300);

/// Lowest replacement id handed out; below that live well-known ports.
const MIN_REPLACEMENT_ID: u16 = 1024;

/// One translated flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatItem {
    /// Original source address
    pub src_addr: IpAddr,
    /// Original source id (port or echo ident)
    pub src_id: u16,
    /// Destination address
    pub dst_addr: IpAddr,
    /// Destination id (port, or echo ident again for ICMP)
    pub dst_id: u16,
    /// Allocated id unique within the bucket
    pub replacement_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowKey {
    src_addr: IpAddr,
    src_id: u16,
    dst_addr: IpAddr,
    dst_id: u16,
}

struct Entry {
    replacement_id: u16,
    last_seen: Instant,
}

#[derive(Default)]
struct Bucket {
    forward: HashMap<FlowKey, Entry>,
    reverse: HashMap<u16, FlowKey>,
}

/// NAT table with one lock per (version, protocol) bucket.
pub struct NatTable {
    buckets: HashMap<(IpVersion, Protocol), Mutex<Bucket>>,
    idle_timeout: Duration,
}

impl NatTable {
    /// Create a table with the given idle timeout.
    pub fn new(idle_timeout: Duration) -> Self {
        let mut buckets = HashMap::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            for protocol in [Protocol::Tcp, Protocol::Udp, Protocol::Icmp, Protocol::IcmpV6] {
                buckets.insert((version, protocol), Mutex::new(Bucket::default()));
            }
        }
        Self {
            buckets,
            idle_timeout,
        }
    }

    fn bucket(&self, version: IpVersion, protocol: Protocol) -> Result<&Mutex<Bucket>> {
        self.buckets
            .get(&(version, protocol))
            .ok_or_else(|| Error::Packet(format!("no NAT for {protocol:?}")))
    }

    fn flow_key(packet: &IpPacket) -> Result<FlowKey> {
        let src_id = packet
            .source_id()
            .ok_or_else(|| Error::Packet("packet has no source id".into()))?;
        let dst_id = packet
            .dest_id()
            .ok_or_else(|| Error::Packet("packet has no destination id".into()))?;
        Ok(FlowKey {
            src_addr: packet.src_addr(),
            src_id,
            dst_addr: packet.dst_addr(),
            dst_id,
        })
    }

    /// Return the item for this packet's flow, allocating one if new.
    pub fn get_or_add(&self, packet: &IpPacket) -> Result<NatItem> {
        let key = Self::flow_key(packet)?;
        let mut bucket = self.bucket(packet.version(), packet.protocol())?.lock();

        if let Some(entry) = bucket.forward.get_mut(&key) {
            entry.last_seen = Instant::now();
            let replacement_id = entry.replacement_id;
            return Ok(item(&key, replacement_id));
        }

        let replacement_id = allocate_id(&bucket.reverse)?;
        bucket.forward.insert(
            key.clone(),
            Entry {
                replacement_id,
                last_seen: Instant::now(),
            },
        );
        bucket.reverse.insert(replacement_id, key.clone());
        Ok(item(&key, replacement_id))
    }

    /// Reverse lookup for a reply packet, refreshing the entry.
    pub fn resolve(
        &self,
        version: IpVersion,
        protocol: Protocol,
        replacement_id: u16,
    ) -> Option<NatItem> {
        let mut bucket = self.bucket(version, protocol).ok()?.lock();
        let key = bucket.reverse.get(&replacement_id)?.clone();
        let entry = bucket.forward.get_mut(&key)?;
        entry.last_seen = Instant::now();
        Some(item(&key, replacement_id))
    }

    /// Evict items idle past the timeout; returns how many went away.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for bucket in self.buckets.values() {
            let mut bucket = bucket.lock();
            let expired: Vec<FlowKey> = bucket
                .forward
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_seen) > self.idle_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(entry) = bucket.forward.remove(&key) {
                    bucket.reverse.remove(&entry.replacement_id);
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            tracing::trace!(evicted, "nat sweep");
        }
        evicted
    }

    /// Number of live items across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.values().map(|b| b.lock().forward.len()).sum()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new(DEFAULT_NAT_TIMEOUT)
    }
}

fn item(key: &FlowKey, replacement_id: u16) -> NatItem {
    NatItem {
        src_addr: key.src_addr,
        src_id: key.src_id,
        dst_addr: key.dst_addr,
        dst_id: key.dst_id,
        replacement_id,
    }
}

/// Pick an unused id, scanning upward from a random base.
fn allocate_id(reverse: &HashMap<u16, FlowKey>) -> Result<u16> {
    let span = (u16::MAX - MIN_REPLACEMENT_ID) as u32;
    let base = MIN_REPLACEMENT_ID + (SecureRandom::u32() % span) as u16;

    for offset in 0..span {
        let candidate = MIN_REPLACEMENT_ID
            + ((base - MIN_REPLACEMENT_ID) as u32 + offset).rem_euclid(span) as u16;
        if !reverse.contains_key(&candidate) {
            return Ok(candidate);
        }
    }
    Err(Error::Packet("NAT bucket exhausted".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_udp;

    fn flow(src_port: u16, dst: &str) -> IpPacket {
        build_udp(
            format!("10.0.0.2:{src_port}").parse().unwrap(),
            dst.parse().unwrap(),
            b"x",
        )
        .unwrap()
    }

    #[test]
    fn test_same_flow_same_item() {
        let nat = NatTable::default();
        let packet = flow(5000, "198.18.0.1:53");

        let a = nat.get_or_add(&packet).unwrap();
        let b = nat.get_or_add(&packet).unwrap();
        assert_eq!(a, b);
        assert_eq!(nat.len(), 1);
    }

    #[test]
    fn test_distinct_flows_distinct_ids() {
        let nat = NatTable::default();
        let a = nat.get_or_add(&flow(5000, "198.18.0.1:53")).unwrap();
        let b = nat.get_or_add(&flow(5001, "198.18.0.1:53")).unwrap();
        let c = nat.get_or_add(&flow(5000, "198.18.0.2:53")).unwrap();

        assert_ne!(a.replacement_id, b.replacement_id);
        assert_ne!(a.replacement_id, c.replacement_id);
        assert_eq!(nat.len(), 3);
    }

    #[test]
    fn test_resolve_reverses() {
        let nat = NatTable::default();
        let packet = flow(6000, "203.0.113.9:443");
        let added = nat.get_or_add(&packet).unwrap();

        let resolved = nat
            .resolve(IpVersion::V4, Protocol::Udp, added.replacement_id)
            .unwrap();
        assert_eq!(resolved, added);

        assert!(nat.resolve(IpVersion::V4, Protocol::Udp, 1).is_none());
        // Wrong bucket misses even with the right id.
        assert!(nat
            .resolve(IpVersion::V4, Protocol::Tcp, added.replacement_id)
            .is_none());
    }

    #[test]
    fn test_sweep_evicts_idle() {
        let nat = NatTable::new(Duration::from_millis(0));
        let added = nat.get_or_add(&flow(6000, "203.0.113.9:443")).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(nat.sweep(), 1);
        assert!(nat.is_empty());
        assert!(nat
            .resolve(IpVersion::V4, Protocol::Udp, added.replacement_id)
            .is_none());
    }

    #[test]
    fn test_replacement_ids_above_floor() {
        let nat = NatTable::default();
        for port in 0..32 {
            let item = nat.get_or_add(&flow(7000 + port, "198.18.0.1:53")).unwrap();
            assert!(item.replacement_id >= 1024);
        }
    }
}
