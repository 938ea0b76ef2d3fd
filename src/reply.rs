//! Decoding of inbound ICMP and ICMPv6 messages.
//!
//! Raw IPv4 sockets deliver the whole datagram including the IP header; raw
//! ICMPv6 sockets deliver only the ICMPv6 message, so the responder comes
//! from the socket address instead.

use std::net::{IpAddr, Ipv6Addr};

use pnet::packet::{
    icmp::{echo_reply::EchoReplyPacket, echo_request::EchoRequestPacket, IcmpPacket, IcmpTypes},
    icmpv6::{Icmpv6Packet, Icmpv6Types},
    ip::{IpNextHeaderProtocol, IpNextHeaderProtocols},
    ipv4::Ipv4Packet,
    ipv6::Ipv6Packet,
    udp::UdpPacket,
    Packet,
};
use serde::Serialize;

use crate::packet::ProbeKey;

/// ICMP error messages carry 4 unused bytes before the quoted datagram
const ICMP_ERROR_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;

/// The ICMP message that answered a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    EchoReply,
    TimeExceeded,
    DestinationUnreachable,
}

impl ReplyKind {
    pub fn name(self) -> &'static str {
        match self {
            ReplyKind::EchoReply => "EchoReply",
            ReplyKind::TimeExceeded => "TimeExceeded",
            ReplyKind::DestinationUnreachable => "DestUnreach",
        }
    }
}

/// A decoded reply and the probe it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub responder: IpAddr,
    pub kind: ReplyKind,
    pub key: ProbeKey,
}

impl Reply {
    pub fn answers(&self, key: ProbeKey) -> bool {
        self.key == key
    }
}

/// Parse a datagram read from a raw IPv4 ICMP socket.
pub fn parse_ipv4(datagram: &[u8]) -> Option<Reply> {
    let ip = Ipv4Packet::new(datagram)?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    let header_len = ip.get_header_length() as usize * 4;
    let message = datagram.get(header_len..)?;
    let icmp = IcmpPacket::new(message)?;
    let icmp_type = icmp.get_icmp_type();

    let (kind, key) = if icmp_type == IcmpTypes::EchoReply {
        let echo = EchoReplyPacket::new(message)?;
        (
            ReplyKind::EchoReply,
            ProbeKey::Echo {
                identifier: echo.get_identifier(),
                sequence: echo.get_sequence_number(),
            },
        )
    } else if icmp_type == IcmpTypes::TimeExceeded {
        (ReplyKind::TimeExceeded, quoted_ipv4(message)?)
    } else if icmp_type == IcmpTypes::DestinationUnreachable {
        (ReplyKind::DestinationUnreachable, quoted_ipv4(message)?)
    } else {
        tracing::trace!("ignoring ICMP type {} from {}", icmp_type.0, ip.get_source());
        return None;
    };

    Some(Reply {
        responder: IpAddr::V4(ip.get_source()),
        kind,
        key,
    })
}

/// Parse a message read from a raw ICMPv6 socket.
pub fn parse_icmpv6(message: &[u8], responder: Ipv6Addr) -> Option<Reply> {
    let icmp = Icmpv6Packet::new(message)?;
    let icmp_type = icmp.get_icmpv6_type();

    let (kind, key) = if icmp_type == Icmpv6Types::EchoReply {
        // Echo Reply shares the Echo Request layout
        let echo = EchoRequestPacket::new(message)?;
        (
            ReplyKind::EchoReply,
            ProbeKey::Echo {
                identifier: echo.get_identifier(),
                sequence: echo.get_sequence_number(),
            },
        )
    } else if icmp_type == Icmpv6Types::TimeExceeded {
        (ReplyKind::TimeExceeded, quoted_ipv6(message)?)
    } else if icmp_type == Icmpv6Types::DestinationUnreachable {
        (ReplyKind::DestinationUnreachable, quoted_ipv6(message)?)
    } else {
        tracing::trace!("ignoring ICMPv6 type {} from {}", icmp_type.0, responder);
        return None;
    };

    Some(Reply {
        responder: IpAddr::V6(responder),
        kind,
        key,
    })
}

fn quoted_ipv4(message: &[u8]) -> Option<ProbeKey> {
    let quoted = message.get(ICMP_ERROR_HEADER_LEN..)?;
    let ip = Ipv4Packet::new(quoted)?;
    let header_len = ip.get_header_length() as usize * 4;
    quoted_transport(ip.get_next_level_protocol(), quoted.get(header_len..)?)
}

fn quoted_ipv6(message: &[u8]) -> Option<ProbeKey> {
    let quoted = message.get(ICMP_ERROR_HEADER_LEN..)?;
    let ip = Ipv6Packet::new(quoted)?;
    quoted_transport(ip.get_next_header(), quoted.get(IPV6_HEADER_LEN..)?)
}

/// Extract the key from the first 8 bytes of the quoted transport header.
fn quoted_transport(protocol: IpNextHeaderProtocol, transport: &[u8]) -> Option<ProbeKey> {
    if protocol == IpNextHeaderProtocols::Udp {
        let udp = UdpPacket::new(transport)?;
        Some(ProbeKey::Udp {
            source_port: udp.get_source(),
            destination_port: udp.get_destination(),
        })
    } else if protocol == IpNextHeaderProtocols::Icmp || protocol == IpNextHeaderProtocols::Icmpv6 {
        let echo = EchoRequestPacket::new(transport)?;
        let echo_type = echo.packet()[0];
        if echo_type != 8 && echo_type != 128 {
            return None;
        }
        Some(ProbeKey::Echo {
            identifier: echo.get_identifier(),
            sequence: echo.get_sequence_number(),
        })
    } else {
        None
    }
}
