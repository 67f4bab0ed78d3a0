//! IP packet parsing and rewriting.
//!
//! The datapath moves whole IP packets as byte buffers; this module is the
//! only place that interprets them. Parsing and checksum maintenance lean on
//! `smoltcp::wire`; the odd ICMP builder that smoltcp has no emit path for
//! is assembled at explicit offsets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use smoltcp::wire::{
    Icmpv4Message, Icmpv4Packet, Icmpv6Message, Icmpv6Packet, IpAddress, IpProtocol, Ipv4Address,
    Ipv4Packet, Ipv6Address, Ipv6Packet, TcpPacket, UdpPacket,
};

use crate::error::{Error, Result};

/// IP version of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// Transport protocol of a packet, as far as the datapath cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// ICMP echo and errors
    Icmp,
    /// ICMPv6
    IcmpV6,
    /// Anything else, by protocol number
    Other(u8),
}

impl From<IpProtocol> for Protocol {
    fn from(proto: IpProtocol) -> Self {
        match proto {
            IpProtocol::Tcp => Protocol::Tcp,
            IpProtocol::Udp => Protocol::Udp,
            IpProtocol::Icmp => Protocol::Icmp,
            IpProtocol::Icmpv6 => Protocol::IcmpV6,
            other => Protocol::Other(other.into()),
        }
    }
}

/// The well-known DNS port.
pub const DNS_PORT: u16 = 53;

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const ICMP_HEADER_LEN: usize = 8;

/// An owned IP packet.
///
/// Construction validates the version nibble and that the buffer covers the
/// declared header; transport accessors re-check their own bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpPacket {
    data: Vec<u8>,
}

impl IpPacket {
    /// Parse a buffer as an IP packet.
    pub fn new(data: impl Into<Vec<u8>>) -> Result<Self> {
        let data = data.into();
        match data.first().map(|b| b >> 4) {
            Some(4) => {
                Ipv4Packet::new_checked(&data[..])
                    .map_err(|e| Error::Packet(format!("ipv4: {e}")))?;
            }
            Some(6) => {
                Ipv6Packet::new_checked(&data[..])
                    .map_err(|e| Error::Packet(format!("ipv6: {e}")))?;
            }
            Some(v) => return Err(Error::Packet(format!("unknown ip version {v}"))),
            None => return Err(Error::Packet("empty packet".into())),
        }
        Ok(Self { data })
    }

    /// The packet bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume into the underlying buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty (never true for a parsed packet).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// IP version.
    pub fn version(&self) -> IpVersion {
        if self.data[0] >> 4 == 4 {
            IpVersion::V4
        } else {
            IpVersion::V6
        }
    }

    /// Transport protocol.
    pub fn protocol(&self) -> Protocol {
        match self.version() {
            IpVersion::V4 => Ipv4Packet::new_unchecked(&self.data[..]).next_header().into(),
            IpVersion::V6 => Ipv6Packet::new_unchecked(&self.data[..]).next_header().into(),
        }
    }

    /// Source address.
    pub fn src_addr(&self) -> IpAddr {
        match self.version() {
            IpVersion::V4 => {
                IpAddr::V4(from_v4(Ipv4Packet::new_unchecked(&self.data[..]).src_addr()))
            }
            IpVersion::V6 => {
                IpAddr::V6(from_v6(Ipv6Packet::new_unchecked(&self.data[..]).src_addr()))
            }
        }
    }

    /// Destination address.
    pub fn dst_addr(&self) -> IpAddr {
        match self.version() {
            IpVersion::V4 => {
                IpAddr::V4(from_v4(Ipv4Packet::new_unchecked(&self.data[..]).dst_addr()))
            }
            IpVersion::V6 => {
                IpAddr::V6(from_v6(Ipv6Packet::new_unchecked(&self.data[..]).dst_addr()))
            }
        }
    }

    /// Whether fragmentation is forbidden: the IPv4 DF bit, and always for
    /// IPv6 (routers never fragment there).
    pub fn dont_fragment(&self) -> bool {
        match self.version() {
            IpVersion::V4 => Ipv4Packet::new_unchecked(&self.data[..]).dont_frag(),
            IpVersion::V6 => true,
        }
    }

    fn transport(&self) -> &[u8] {
        match self.version() {
            IpVersion::V4 => {
                let header_len = ((self.data[0] & 0x0f) as usize) * 4;
                &self.data[header_len.min(self.data.len())..]
            }
            IpVersion::V6 => &self.data[IPV6_HEADER_LEN.min(self.data.len())..],
        }
    }

    fn transport_offset(&self) -> usize {
        match self.version() {
            IpVersion::V4 => ((self.data[0] & 0x0f) as usize) * 4,
            IpVersion::V6 => IPV6_HEADER_LEN,
        }
    }

    /// Source identifier for NAT: TCP/UDP source port or ICMP echo ident.
    pub fn source_id(&self) -> Option<u16> {
        let transport = self.transport();
        match self.protocol() {
            Protocol::Tcp => TcpPacket::new_checked(transport).ok().map(|p| p.src_port()),
            Protocol::Udp => UdpPacket::new_checked(transport).ok().map(|p| p.src_port()),
            Protocol::Icmp => {
                let icmp = Icmpv4Packet::new_checked(transport).ok()?;
                matches!(
                    icmp.msg_type(),
                    Icmpv4Message::EchoRequest | Icmpv4Message::EchoReply
                )
                .then(|| icmp.echo_ident())
            }
            _ => None,
        }
    }

    /// Destination identifier: TCP/UDP destination port or ICMP echo ident.
    pub fn dest_id(&self) -> Option<u16> {
        let transport = self.transport();
        match self.protocol() {
            Protocol::Tcp => TcpPacket::new_checked(transport).ok().map(|p| p.dst_port()),
            Protocol::Udp => UdpPacket::new_checked(transport).ok().map(|p| p.dst_port()),
            Protocol::Icmp => self.source_id(),
            _ => None,
        }
    }

    /// Source endpoint for TCP/UDP packets.
    pub fn src_endpoint(&self) -> Option<SocketAddr> {
        match self.protocol() {
            Protocol::Tcp | Protocol::Udp => {
                Some(SocketAddr::new(self.src_addr(), self.source_id()?))
            }
            _ => None,
        }
    }

    /// Destination endpoint for TCP/UDP packets.
    pub fn dst_endpoint(&self) -> Option<SocketAddr> {
        match self.protocol() {
            Protocol::Tcp | Protocol::Udp => {
                Some(SocketAddr::new(self.dst_addr(), self.dest_id()?))
            }
            _ => None,
        }
    }

    /// UDP payload bytes, if this is a UDP packet.
    pub fn udp_payload(&self) -> Option<&[u8]> {
        if self.protocol() != Protocol::Udp {
            return None;
        }
        let udp = UdpPacket::new_checked(self.transport()).ok()?;
        let len = (udp.len() as usize).checked_sub(UDP_HEADER_LEN)?;
        let transport = self.transport();
        transport.get(UDP_HEADER_LEN..UDP_HEADER_LEN + len)
    }

    /// ICMP message bytes (header included), if this is ICMP.
    pub fn icmp_bytes(&self) -> Option<&[u8]> {
        matches!(self.protocol(), Protocol::Icmp | Protocol::IcmpV6).then(|| self.transport())
    }

    /// Whether this is a DNS query by destination port.
    pub fn is_dns(&self) -> bool {
        self.protocol() == Protocol::Udp && self.dest_id() == Some(DNS_PORT)
    }

    /// Whether this is an ICMP echo request (v4 or v6).
    pub fn is_icmp_echo_request(&self) -> bool {
        let transport = self.transport();
        match self.protocol() {
            Protocol::Icmp => Icmpv4Packet::new_checked(transport)
                .map(|p| p.msg_type() == Icmpv4Message::EchoRequest)
                .unwrap_or(false),
            Protocol::IcmpV6 => Icmpv6Packet::new_checked(transport)
                .map(|p| p.msg_type() == Icmpv6Message::EchoRequest)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Whether this is IPv6 neighbor/router discovery control traffic.
    pub fn is_ipv6_discovery(&self) -> bool {
        if self.protocol() != Protocol::IcmpV6 {
            return false;
        }
        Icmpv6Packet::new_checked(self.transport())
            .map(|p| {
                matches!(
                    p.msg_type(),
                    Icmpv6Message::RouterSolicit
                        | Icmpv6Message::RouterAdvert
                        | Icmpv6Message::NeighborSolicit
                        | Icmpv6Message::NeighborAdvert
                )
            })
            .unwrap_or(false)
    }

    /// Rewrite the source address and transport id, refreshing checksums.
    pub fn rewrite_source(&mut self, addr: IpAddr, id: u16) -> Result<()> {
        self.rewrite(addr, id, true)
    }

    /// Rewrite the destination address and transport id, refreshing checksums.
    pub fn rewrite_destination(&mut self, addr: IpAddr, id: u16) -> Result<()> {
        self.rewrite(addr, id, false)
    }

    fn rewrite(&mut self, addr: IpAddr, id: u16, source: bool) -> Result<()> {
        let offset = self.transport_offset();
        let protocol = self.protocol();
        let version = self.version();

        // IP header first.
        match (version, addr) {
            (IpVersion::V4, IpAddr::V4(v4)) => {
                let mut ip = Ipv4Packet::new_unchecked(&mut self.data[..]);
                if source {
                    ip.set_src_addr(to_v4(v4));
                } else {
                    ip.set_dst_addr(to_v4(v4));
                }
                ip.fill_checksum();
            }
            (IpVersion::V6, IpAddr::V6(v6)) => {
                let mut ip = Ipv6Packet::new_unchecked(&mut self.data[..]);
                if source {
                    ip.set_src_addr(to_v6(v6));
                } else {
                    ip.set_dst_addr(to_v6(v6));
                }
            }
            _ => return Err(Error::Packet("address family mismatch".into())),
        }

        let (src, dst) = (ip_address(self.src_addr()), ip_address(self.dst_addr()));
        let transport = &mut self.data[offset..];
        match protocol {
            Protocol::Udp => {
                let mut udp = UdpPacket::new_checked(transport)
                    .map_err(|e| Error::Packet(format!("udp: {e}")))?;
                if source {
                    udp.set_src_port(id);
                } else {
                    udp.set_dst_port(id);
                }
                udp.fill_checksum(&src, &dst);
            }
            Protocol::Tcp => {
                let mut tcp = TcpPacket::new_checked(transport)
                    .map_err(|e| Error::Packet(format!("tcp: {e}")))?;
                if source {
                    tcp.set_src_port(id);
                } else {
                    tcp.set_dst_port(id);
                }
                tcp.fill_checksum(&src, &dst);
            }
            Protocol::Icmp => {
                let mut icmp = Icmpv4Packet::new_checked(transport)
                    .map_err(|e| Error::Packet(format!("icmp: {e}")))?;
                if matches!(
                    icmp.msg_type(),
                    Icmpv4Message::EchoRequest | Icmpv4Message::EchoReply
                ) {
                    icmp.set_echo_ident(id);
                    icmp.fill_checksum();
                }
            }
            Protocol::IcmpV6 => {
                let mut icmp = Icmpv6Packet::new_checked(transport)
                    .map_err(|e| Error::Packet(format!("icmpv6: {e}")))?;
                if matches!(
                    icmp.msg_type(),
                    Icmpv6Message::EchoRequest | Icmpv6Message::EchoReply
                ) {
                    icmp.set_echo_ident(id);
                    icmp.fill_checksum(&src, &dst);
                }
            }
            Protocol::Other(_) => {}
        }
        Ok(())
    }
}

/// Build a UDP packet from scratch (proxy replies back into the tunnel).
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<IpPacket> {
    match (src, dst) {
        (SocketAddr::V4(s), SocketAddr::V4(d)) => {
            let total = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
            let mut buf = vec![0u8; total];

            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.set_version(4);
            ip.set_header_len(IPV4_HEADER_LEN as u8);
            ip.set_total_len(total as u16);
            ip.set_hop_limit(64);
            ip.set_next_header(IpProtocol::Udp);
            ip.set_src_addr(to_v4(*s.ip()));
            ip.set_dst_addr(to_v4(*d.ip()));
            ip.fill_checksum();

            emit_udp(
                &mut buf[IPV4_HEADER_LEN..],
                src.port(),
                dst.port(),
                payload,
                ip_address(IpAddr::V4(*s.ip())),
                ip_address(IpAddr::V4(*d.ip())),
            );
            IpPacket::new(buf)
        }
        (SocketAddr::V6(s), SocketAddr::V6(d)) => {
            let payload_len = UDP_HEADER_LEN + payload.len();
            let mut buf = vec![0u8; IPV6_HEADER_LEN + payload_len];

            let mut ip = Ipv6Packet::new_unchecked(&mut buf[..]);
            ip.set_version(6);
            ip.set_payload_len(payload_len as u16);
            ip.set_hop_limit(64);
            ip.set_next_header(IpProtocol::Udp);
            ip.set_src_addr(to_v6(*s.ip()));
            ip.set_dst_addr(to_v6(*d.ip()));

            emit_udp(
                &mut buf[IPV6_HEADER_LEN..],
                src.port(),
                dst.port(),
                payload,
                ip_address(IpAddr::V6(*s.ip())),
                ip_address(IpAddr::V6(*d.ip())),
            );
            IpPacket::new(buf)
        }
        _ => Err(Error::Packet("address family mismatch".into())),
    }
}

fn emit_udp(
    buf: &mut [u8],
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
    src: IpAddress,
    dst: IpAddress,
) {
    let mut udp = UdpPacket::new_unchecked(&mut buf[..]);
    udp.set_src_port(src_port);
    udp.set_dst_port(dst_port);
    udp.set_len((UDP_HEADER_LEN + payload.len()) as u16);
    udp.payload_mut()[..payload.len()].copy_from_slice(payload);
    udp.fill_checksum(&src, &dst);
}

/// Wrap a raw ICMPv4 message in an IPv4 header (ping proxy replies).
pub fn build_icmp_v4(src: Ipv4Addr, dst: Ipv4Addr, icmp_message: &[u8]) -> Result<IpPacket> {
    let total = IPV4_HEADER_LEN + icmp_message.len();
    let mut buf = vec![0u8; total];

    let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip.set_version(4);
    ip.set_header_len(IPV4_HEADER_LEN as u8);
    ip.set_total_len(total as u16);
    ip.set_hop_limit(64);
    ip.set_next_header(IpProtocol::Icmp);
    ip.set_src_addr(to_v4(src));
    ip.set_dst_addr(to_v4(dst));
    ip.fill_checksum();

    buf[IPV4_HEADER_LEN..].copy_from_slice(icmp_message);
    IpPacket::new(buf)
}

/// Build the ICMPv4 "fragmentation needed" reply for an oversized DF packet.
///
/// Sent back toward the origin so path-MTU discovery converges on
/// `mtu`. Quotes the offending IP header plus eight payload bytes, as the
/// protocol requires.
pub fn build_fragmentation_needed(original: &IpPacket, mtu: u16) -> Result<IpPacket> {
    if original.version() != IpVersion::V4 {
        return Err(Error::Packet("fragmentation-needed is ipv4 only".into()));
    }
    let (IpAddr::V4(orig_src), IpAddr::V4(orig_dst)) = (original.src_addr(), original.dst_addr())
    else {
        return Err(Error::Packet("address family mismatch".into()));
    };

    let quoted = &original.as_bytes()[..original.len().min(original.transport_offset() + 8)];
    let icmp_len = ICMP_HEADER_LEN + quoted.len();
    let mut icmp = vec![0u8; icmp_len];

    // type 3 (destination unreachable), code 4 (fragmentation needed and DF
    // set), next-hop MTU in the last two bytes of the otherwise unused word.
    icmp[0] = 3;
    icmp[1] = 4;
    icmp[6..8].copy_from_slice(&mtu.to_be_bytes());
    icmp[ICMP_HEADER_LEN..].copy_from_slice(quoted);

    let mut packet = Icmpv4Packet::new_unchecked(&mut icmp[..]);
    packet.fill_checksum();

    // The reply flows back to whoever sent the oversized packet, sourced
    // from its original destination.
    build_icmp_v4(orig_dst, orig_src, &icmp)
}

fn to_v4(addr: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&addr.octets())
}

fn from_v4(addr: Ipv4Address) -> Ipv4Addr {
    let o = addr.as_bytes();
    Ipv4Addr::new(o[0], o[1], o[2], o[3])
}

fn to_v6(addr: Ipv6Addr) -> Ipv6Address {
    Ipv6Address::from_bytes(&addr.octets())
}

fn from_v6(addr: Ipv6Address) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(addr.as_bytes());
    Ipv6Addr::from(octets)
}

fn ip_address(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(to_v4(v4)),
        IpAddr::V6(v6) => IpAddress::Ipv6(to_v6(v6)),
    }
}
