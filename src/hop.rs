//! Per-hop records and the aggregated trace result.

use std::{
    net::IpAddr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::args::ProbeProtocol;
use crate::reply::{Reply, ReplyKind};
use crate::utils;

/// Outcome of probing a single TTL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopRecord {
    pub ttl: u8,
    /// `None` when the probe timed out
    pub responder: Option<IpAddr>,
    pub resolved_name: Option<String>,
    pub rtt_ms: Option<f64>,
    pub reached_destination: bool,
    pub reply_kind: Option<ReplyKind>,
}

impl HopRecord {
    pub fn timed_out(ttl: u8) -> Self {
        Self {
            ttl,
            responder: None,
            resolved_name: None,
            rtt_ms: None,
            reached_destination: false,
            reply_kind: None,
        }
    }

    pub fn replied(ttl: u8, reply: &Reply, rtt: Duration, destination: IpAddr) -> Self {
        Self {
            ttl,
            responder: Some(reply.responder),
            resolved_name: None,
            rtt_ms: Some(utils::time::duration_to_ms_f64(rtt)),
            reached_destination: reply.responder == destination,
            reply_kind: Some(reply.kind),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.responder.is_none()
    }

    /// Hostname when one was resolved, otherwise the address.
    pub fn display_name(&self) -> String {
        utils::network::format_hostname_with_fallback(self.resolved_name.clone(), self.responder)
    }
}

/// The finished, read-only result of a trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceResult {
    target: String,
    destination: IpAddr,
    protocol: ProbeProtocol,
    max_hops: u8,
    started_at: DateTime<Utc>,
    final_timeout_ms: f64,
    destination_reached: bool,
    hops: Vec<HopRecord>,
}

impl TraceResult {
    pub(crate) fn new(
        target: String,
        destination: IpAddr,
        protocol: ProbeProtocol,
        max_hops: u8,
        started_at: DateTime<Utc>,
        final_timeout: Duration,
        hops: Vec<HopRecord>,
    ) -> Self {
        let destination_reached = hops.last().is_some_and(|hop| hop.reached_destination);
        Self {
            target,
            destination,
            protocol,
            max_hops,
            started_at,
            final_timeout_ms: utils::time::duration_to_ms_f64(final_timeout),
            destination_reached,
            hops,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    pub fn protocol(&self) -> ProbeProtocol {
        self.protocol
    }

    pub fn max_hops(&self) -> u8 {
        self.max_hops
    }

    /// Wait bound in effect when the session ended.
    pub fn final_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.final_timeout_ms / 1000.0)
    }

    /// Hops in TTL order, starting at 1.
    pub fn hops(&self) -> &[HopRecord] {
        &self.hops
    }

    pub fn destination_reached(&self) -> bool {
        self.destination_reached
    }

    /// Hops that produced a round-trip time.
    pub fn measured(&self) -> impl Iterator<Item = &HopRecord> {
        self.hops.iter().filter(|hop| hop.rtt_ms.is_some())
    }

    pub fn timeouts(&self) -> usize {
        self.hops.iter().filter(|hop| hop.is_timeout()).count()
    }

    pub fn mean_rtt_ms(&self) -> Option<f64> {
        let rtts: Vec<f64> = self.measured().filter_map(|hop| hop.rtt_ms).collect();
        utils::math::mean(&rtts)
    }

    pub fn min_rtt_ms(&self) -> Option<f64> {
        self.measured().filter_map(|hop| hop.rtt_ms).reduce(f64::min)
    }

    pub fn max_rtt_ms(&self) -> Option<f64> {
        self.measured().filter_map(|hop| hop.rtt_ms).reduce(f64::max)
    }

    /// `(hop number, RTT)` pairs for the chart renderer.
    pub fn rtt_series(&self) -> Vec<(u8, Option<f64>)> {
        self.hops.iter().map(|hop| (hop.ttl, hop.rtt_ms)).collect()
    }
}
