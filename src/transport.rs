//! Per-hop socket handling.
//!
//! Every TTL gets its own send/receive socket pair. The pair lives in a
//! [`HopChannel`] value, so the descriptors are closed and the hop-limit
//! option discarded when that value is dropped, on every exit path.

use std::{
    io,
    mem::MaybeUninit,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{debug, trace};

use crate::args::ProbeProtocol;
use crate::error::TraceError;
use crate::packet::{ProbeKey, ProbePacket, ProbeTarget};
use crate::reply::{self, Reply};
use crate::session::MAX_TIMEOUT;

/// Maximum MTU size for network packets
const MAX_MTU: usize = 1500;

/// Result of one bounded receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Reply(Reply),
    TimedOut,
}

/// One hop's socket pair.
pub trait HopChannel {
    fn send(&mut self, packet: &ProbePacket) -> Result<(), TraceError>;

    /// Wait at most `timeout` for a reply to the probe that was sent.
    ///
    /// Replies to other probes are skipped without extending the wait.
    fn receive(&mut self, timeout: Duration) -> Result<Received, TraceError>;
}

/// Source of per-hop channels.
pub trait ProbeTransport {
    type Channel: HopChannel;

    /// Acquire a fresh channel whose outgoing packets carry `ttl`.
    fn open(
        &mut self,
        target: &ProbeTarget,
        protocol: ProbeProtocol,
        ttl: u8,
    ) -> Result<Self::Channel, TraceError>;
}

/// Raw-socket transport. Requires root or CAP_NET_RAW.
#[derive(Debug, Default)]
pub struct RawSocketTransport;

impl RawSocketTransport {
    /// Fails with [`TraceError::Permission`] when raw sockets are unavailable,
    /// before any probe is sent.
    pub fn new(target: &ProbeTarget) -> Result<Self, TraceError> {
        let (domain, protocol) = icmp_domain(target);
        Socket::new(domain, Type::RAW, Some(protocol))
            .map_err(|e| TraceError::from_socket("open raw ICMP socket", e))?;
        Ok(Self)
    }
}

impl ProbeTransport for RawSocketTransport {
    type Channel = RawHopChannel;

    fn open(
        &mut self,
        target: &ProbeTarget,
        protocol: ProbeProtocol,
        ttl: u8,
    ) -> Result<Self::Channel, TraceError> {
        let (domain, icmp_protocol) = icmp_domain(target);

        // Open the receiver first so a fast reply cannot be missed
        let recv_socket = Socket::new(domain, Type::RAW, Some(icmp_protocol))
            .map_err(|e| TraceError::from_socket("open receive socket", e))?;

        let send_protocol = match protocol {
            ProbeProtocol::Icmp => icmp_protocol,
            ProbeProtocol::Udp => Protocol::UDP,
        };
        let send_socket = Socket::new(domain, Type::RAW, Some(send_protocol))
            .map_err(|e| TraceError::from_socket("open send socket", e))?;

        let hop_limit = if target.is_ipv6() {
            send_socket.set_unicast_hops_v6(ttl.into())
        } else {
            send_socket.set_ttl(ttl.into())
        };
        hop_limit.map_err(|e| TraceError::from_socket("set hop limit", e))?;

        trace!("opened {} {:?} socket pair for ttl={}", target.family_name(), protocol, ttl);

        Ok(RawHopChannel {
            send_socket,
            recv_socket,
            destination: target.destination(),
            expected: None,
        })
    }
}

fn icmp_domain(target: &ProbeTarget) -> (Domain, Protocol) {
    if target.is_ipv6() {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    }
}

/// Send/receive socket pair for a single TTL. Dropping it closes both.
#[derive(Debug)]
pub struct RawHopChannel {
    send_socket: Socket,
    recv_socket: Socket,
    destination: IpAddr,
    expected: Option<ProbeKey>,
}

impl HopChannel for RawHopChannel {
    fn send(&mut self, packet: &ProbePacket) -> Result<(), TraceError> {
        // Raw IPv6 sockets reject a non-zero port that differs from the protocol
        let dst = SockAddr::from(SocketAddr::new(self.destination, 0));
        self.send_socket
            .send_to(packet.as_bytes(), &dst)
            .map_err(|e| TraceError::from_socket("send probe", e))?;
        self.expected = Some(packet.key());
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Received, TraceError> {
        let Some(expected) = self.expected else {
            return Ok(Received::TimedOut);
        };
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout.min(MAX_TIMEOUT))
            .unwrap_or(started);
        let mut buffer = [0u8; MAX_MTU];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Received::TimedOut);
            }
            self.recv_socket
                .set_read_timeout(Some(remaining))
                .map_err(|e| TraceError::from_socket("set receive timeout", e))?;

            let (len, from) = match recv_from(&self.recv_socket, &mut buffer) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Ok(Received::TimedOut);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TraceError::from_socket("receive reply", e)),
            };

            let parsed = match self.destination {
                IpAddr::V4(_) => reply::parse_ipv4(&buffer[..len]),
                IpAddr::V6(_) => match from.as_socket() {
                    Some(SocketAddr::V6(addr)) => reply::parse_icmpv6(&buffer[..len], *addr.ip()),
                    _ => None,
                },
            };

            match parsed {
                Some(reply) if reply.answers(expected) => return Ok(Received::Reply(reply)),
                Some(other) => debug!("discarding reply from {} for {:?}", other.responder, other.key),
                None => {}
            }
        }
    }
}

fn recv_from(socket: &Socket, buffer: &mut [u8]) -> io::Result<(usize, SockAddr)> {
    // SAFETY: an initialized buffer is valid as MaybeUninit, and recv_from
    // only ever writes initialized bytes into it.
    let uninit = unsafe { &mut *(buffer as *mut [u8] as *mut [MaybeUninit<u8>]) };
    socket.recv_from(uninit)
}

/// Detect the local source address the kernel would use to reach `target`.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn detect_source_ip(target: IpAddr) -> Option<IpAddr> {
    let bind: SocketAddr = match target {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind(bind)?;
        socket.connect((target, 53))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(source) if !source.is_unspecified() => Some(source),
        Ok(_) => None,
        Err(e) => {
            debug!("could not determine source address for {}: {}", target, e);
            None
        }
    }
}
