//! Probe packet construction.
//!
//! The address family is decided once per session and captured in a
//! [`ProbeTarget`], which carries everything the family-specific builders
//! need: the destination, and the local source address for pseudo-header
//! checksums when it is known.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::RangeInclusive;

use rand::Rng;
use serde::Serialize;

use crate::args::ProbeProtocol;
use crate::checksum::{internet_checksum, pseudo_header_checksum};

/// ICMP and ICMPv6 Echo header size
pub const ICMP_HEADER_LEN: usize = 8;
/// UDP header size
pub const UDP_HEADER_LEN: usize = 8;
/// Fixed payload that pads every probe to a recognizable size
pub const PROBE_PAYLOAD: &[u8] = b"hoptrace-probe!!";

/// Destination ports conventionally used by traceroute
pub const UDP_PORT_RANGE: RangeInclusive<u16> = 33434..=33534;
/// UDP source ports are `UDP_SOURCE_PORT_BASE + sequence`
const UDP_SOURCE_PORT_BASE: u16 = 0x8000;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

/// Per-session value used to recognize replies to our own probes.
///
/// ICMP mode: the Echo identifier. UDP mode: the destination port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeIdentifier(u16);

impl ProbeIdentifier {
    pub fn new(value: u16) -> Self {
        Self(value)
    }

    /// Pick a fresh identifier so concurrent invocations do not collide.
    pub fn random<R: Rng + ?Sized>(protocol: ProbeProtocol, rng: &mut R) -> Self {
        match protocol {
            ProbeProtocol::Icmp => Self(rng.gen()),
            ProbeProtocol::Udp => Self(rng.gen_range(UDP_PORT_RANGE)),
        }
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

/// What a reply must quote back for it to belong to a given probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKey {
    Echo { identifier: u16, sequence: u16 },
    Udp { source_port: u16, destination_port: u16 },
}

/// An immutable, ready-to-send probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePacket {
    bytes: Vec<u8>,
    key: ProbeKey,
}

impl ProbePacket {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn key(&self) -> ProbeKey {
        self.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Target {
    pub destination: Ipv4Addr,
    pub source: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Target {
    pub destination: Ipv6Addr,
    /// Needed for the ICMPv6 and UDP pseudo-header. Without it the checksum
    /// field is left zero, which only a kernel that fills it in will accept.
    pub source: Option<Ipv6Addr>,
}

/// Address-family strategy selected once at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    V4(Ipv4Target),
    V6(Ipv6Target),
}

impl ProbeTarget {
    /// A `source` of the other family is ignored.
    pub fn new(destination: IpAddr, source: Option<IpAddr>) -> Self {
        match destination {
            IpAddr::V4(destination) => ProbeTarget::V4(Ipv4Target {
                destination,
                source: match source {
                    Some(IpAddr::V4(src)) => Some(src),
                    _ => None,
                },
            }),
            IpAddr::V6(destination) => ProbeTarget::V6(Ipv6Target {
                destination,
                source: match source {
                    Some(IpAddr::V6(src)) => Some(src),
                    _ => None,
                },
            }),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self {
            ProbeTarget::V4(t) => IpAddr::V4(t.destination),
            ProbeTarget::V6(t) => IpAddr::V6(t.destination),
        }
    }

    pub fn source(&self) -> Option<IpAddr> {
        match self {
            ProbeTarget::V4(t) => t.source.map(IpAddr::V4),
            ProbeTarget::V6(t) => t.source.map(IpAddr::V6),
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, ProbeTarget::V6(_))
    }

    pub fn family_name(&self) -> &'static str {
        match self {
            ProbeTarget::V4(_) => "IPv4",
            ProbeTarget::V6(_) => "IPv6",
        }
    }

    /// Build the probe for `sequence`. Performs no I/O.
    pub fn build(
        &self,
        protocol: ProbeProtocol,
        identifier: ProbeIdentifier,
        sequence: u16,
    ) -> ProbePacket {
        match protocol {
            ProbeProtocol::Icmp => {
                let bytes = match self {
                    ProbeTarget::V4(_) => icmpv4_echo_request(identifier.value(), sequence),
                    ProbeTarget::V6(t) => icmpv6_echo_request(t, identifier.value(), sequence),
                };
                ProbePacket {
                    bytes,
                    key: ProbeKey::Echo {
                        identifier: identifier.value(),
                        sequence,
                    },
                }
            }
            ProbeProtocol::Udp => {
                let source_port = udp_source_port(sequence);
                let destination_port = identifier.value();
                ProbePacket {
                    bytes: udp_datagram(self, source_port, destination_port),
                    key: ProbeKey::Udp {
                        source_port,
                        destination_port,
                    },
                }
            }
        }
    }
}

fn udp_source_port(sequence: u16) -> u16 {
    UDP_SOURCE_PORT_BASE | (sequence & 0x7fff)
}

fn echo_header(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN];
    packet[0] = icmp_type;
    // code and checksum stay zero
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(PROBE_PAYLOAD);
    packet
}

fn icmpv4_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = echo_header(ICMP_ECHO_REQUEST, identifier, sequence);
    let checksum = internet_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

fn icmpv6_echo_request(target: &Ipv6Target, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = echo_header(ICMPV6_ECHO_REQUEST, identifier, sequence);
    if let Some(source) = target.source {
        let checksum = pseudo_header_checksum(
            IpAddr::V6(source),
            IpAddr::V6(target.destination),
            IPPROTO_ICMPV6,
            &packet,
        )
        .unwrap_or(0);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

fn udp_datagram(target: &ProbeTarget, source_port: u16, destination_port: u16) -> Vec<u8> {
    let length = (UDP_HEADER_LEN + PROBE_PAYLOAD.len()) as u16;
    let mut packet = Vec::with_capacity(length as usize);
    packet.extend_from_slice(&source_port.to_be_bytes());
    packet.extend_from_slice(&destination_port.to_be_bytes());
    packet.extend_from_slice(&length.to_be_bytes());
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(PROBE_PAYLOAD);

    if let Some(source) = target.source() {
        if let Some(checksum) =
            pseudo_header_checksum(source, target.destination(), IPPROTO_UDP, &packet)
        {
            // zero means "no checksum" on the wire
            let checksum = if checksum == 0 { 0xffff } else { checksum };
            packet[6..8].copy_from_slice(&checksum.to_be_bytes());
        }
    }
    packet
}
