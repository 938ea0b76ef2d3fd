//! The probe session: a sequential TTL loop with an adaptive wait bound.

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::args::ProbeProtocol;
use crate::error::TraceError;
use crate::hop::{HopRecord, TraceResult};
use crate::packet::{ProbeIdentifier, ProbeTarget};
use crate::resolve::{AddressFamily, DestinationResolver, ReverseLookup};
use crate::transport::{self, HopChannel, ProbeTransport, Received};

pub const DEFAULT_MAX_HOPS: u8 = 30;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT_STEP: Duration = Duration::from_secs(1);
/// Consecutive timeouts after which the wait bound grows
pub const BACKOFF_AFTER_TIMEOUTS: usize = 3;
/// Ceiling for the initial wait, the step and the grown bound
pub const MAX_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub protocol: ProbeProtocol,
    pub max_hops: u8,
    pub initial_timeout: Duration,
    pub timeout_step: Duration,
    pub backoff_after: usize,
    /// Random per session when `None`
    pub identifier: Option<ProbeIdentifier>,
    /// Record a hop whose sockets fail as unanswered instead of aborting
    pub keep_going: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: ProbeProtocol::Icmp,
            max_hops: DEFAULT_MAX_HOPS,
            initial_timeout: DEFAULT_TIMEOUT,
            timeout_step: DEFAULT_TIMEOUT_STEP,
            backoff_after: BACKOFF_AFTER_TIMEOUTS,
            identifier: None,
            keep_going: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), TraceError> {
        if self.max_hops == 0 {
            return Err(TraceError::InvalidConfig("max hops must be at least 1".into()));
        }
        if self.initial_timeout.is_zero() {
            return Err(TraceError::InvalidConfig("initial timeout must be positive".into()));
        }
        if self.initial_timeout > MAX_TIMEOUT {
            return Err(TraceError::InvalidConfig(format!(
                "initial timeout must not exceed {}s",
                MAX_TIMEOUT.as_secs()
            )));
        }
        if self.timeout_step > MAX_TIMEOUT {
            return Err(TraceError::InvalidConfig(format!(
                "timeout step must not exceed {}s",
                MAX_TIMEOUT.as_secs()
            )));
        }
        if self.backoff_after == 0 {
            return Err(TraceError::InvalidConfig("backoff threshold must be at least 1".into()));
        }
        Ok(())
    }
}

/// Wait bound that grows under sustained loss and never shrinks.
///
/// Every timeout that leaves the streak of consecutive timeouts at or above
/// the threshold adds one step, up to [`MAX_TIMEOUT`]; any reply resets the
/// streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveTimeout {
    current: Duration,
    step: Duration,
    threshold: usize,
    streak: usize,
}

impl AdaptiveTimeout {
    pub fn new(initial: Duration, step: Duration, threshold: usize) -> Self {
        Self {
            current: initial,
            step,
            threshold,
            streak: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn streak(&self) -> usize {
        self.streak
    }

    /// Returns true when the bound was raised.
    pub fn on_timeout(&mut self) -> bool {
        self.streak = self.streak.saturating_add(1);
        if self.streak < self.threshold {
            return false;
        }
        let raised = self.current.saturating_add(self.step).min(MAX_TIMEOUT.max(self.current));
        let grew = raised > self.current;
        self.current = raised;
        grew
    }

    pub fn on_reply(&mut self) {
        self.streak = 0;
    }
}

/// Classification of one TTL's exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopOutcome {
    Timeout,
    Replied,
    DestinationReached,
    /// Socket fault tolerated under `keep_going`
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Last TTL probed
    Probing(u8),
    Terminated { reached: bool },
}

/// Identification of a session, handed to observers when probing begins.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub target: String,
    pub destination: IpAddr,
    pub source: Option<IpAddr>,
    pub protocol: ProbeProtocol,
    pub identifier: ProbeIdentifier,
    pub max_hops: u8,
    pub initial_timeout: Duration,
}

/// Receives session events as they happen.
pub trait SessionObserver {
    fn session_started(&mut self, _info: &SessionInfo) {}
    fn hop_completed(&mut self, _hop: &HopRecord) {}
    fn timeout_raised(&mut self, _timeout: Duration) {}
    fn hop_failed(&mut self, _ttl: u8, _error: &TraceError) {}
    fn session_finished(&mut self, _result: &TraceResult) {}
}

impl SessionObserver for () {}

/// Mutable state of one trace; consumed into a [`TraceResult`].
#[derive(Debug)]
pub struct ProbeSession {
    target_name: String,
    target: ProbeTarget,
    config: SessionConfig,
    identifier: ProbeIdentifier,
    hops: Vec<HopRecord>,
    timeout: AdaptiveTimeout,
    state: SessionState,
    started_at: DateTime<Utc>,
    /// Fault of the last hop when it was tolerated under `keep_going`
    last_failure: Option<TraceError>,
}

impl ProbeSession {
    pub fn new(
        target_name: impl Into<String>,
        target: ProbeTarget,
        config: SessionConfig,
    ) -> Result<Self, TraceError> {
        config.validate()?;
        let identifier = config
            .identifier
            .unwrap_or_else(|| ProbeIdentifier::random(config.protocol, &mut rand::thread_rng()));
        let timeout = AdaptiveTimeout::new(config.initial_timeout, config.timeout_step, config.backoff_after);

        Ok(Self {
            target_name: target_name.into(),
            target,
            identifier,
            hops: Vec::with_capacity(config.max_hops as usize),
            timeout,
            state: SessionState::Idle,
            started_at: Utc::now(),
            last_failure: None,
            config,
        })
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            target: self.target_name.clone(),
            destination: self.target.destination(),
            source: self.target.source(),
            protocol: self.config.protocol,
            identifier: self.identifier,
            max_hops: self.config.max_hops,
            initial_timeout: self.config.initial_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn hops(&self) -> &[HopRecord] {
        &self.hops
    }

    pub fn current_timeout(&self) -> Duration {
        self.timeout.current()
    }

    pub fn identifier(&self) -> ProbeIdentifier {
        self.identifier
    }

    /// Probe the next TTL. Returns `None` once the session has terminated.
    ///
    /// Send and receive faults end the session unless `keep_going` is set;
    /// setup faults always do.
    pub fn step<T, L>(&mut self, transport: &mut T, lookup: &L) -> Result<Option<HopOutcome>, TraceError>
    where
        T: ProbeTransport,
        L: ReverseLookup + ?Sized,
    {
        let ttl = match self.state {
            SessionState::Terminated { .. } => return Ok(None),
            SessionState::Idle => 1,
            SessionState::Probing(last) => last + 1,
        };
        self.state = SessionState::Probing(ttl);

        let destination = self.target.destination();
        let wait = self.timeout.current();
        self.last_failure = None;

        let (record, outcome) = match self.exchange(transport, ttl, wait) {
            Ok((Received::Reply(reply), rtt)) => {
                self.timeout.on_reply();
                let mut record = HopRecord::replied(ttl, &reply, rtt, destination);
                record.resolved_name = lookup.reverse(reply.responder);
                let outcome = if record.reached_destination {
                    HopOutcome::DestinationReached
                } else {
                    HopOutcome::Replied
                };
                debug!(
                    "ttl={} {} from {} in {:.2}ms",
                    ttl,
                    reply.kind.name(),
                    reply.responder,
                    rtt.as_secs_f64() * 1000.0
                );
                (record, outcome)
            }
            Ok((Received::TimedOut, _)) => {
                if self.timeout.on_timeout() {
                    info!(
                        "{} consecutive timeouts, waiting {:?} per probe",
                        self.timeout.streak(),
                        self.timeout.current()
                    );
                }
                debug!("ttl={} timed out after {:?}", ttl, wait);
                (HopRecord::timed_out(ttl), HopOutcome::Timeout)
            }
            Err(e) if self.config.keep_going && !e.is_setup_error() => {
                warn!("ttl={} failed, continuing: {}", ttl, e);
                self.last_failure = Some(e);
                (HopRecord::timed_out(ttl), HopOutcome::Failed)
            }
            Err(e) => {
                self.state = SessionState::Terminated { reached: false };
                return Err(e);
            }
        };

        self.hops.push(record);

        if outcome == HopOutcome::DestinationReached {
            self.state = SessionState::Terminated { reached: true };
        } else if ttl >= self.config.max_hops {
            self.state = SessionState::Terminated { reached: false };
        }
        Ok(Some(outcome))
    }

    /// Send one probe on a fresh channel and wait for its reply.
    ///
    /// The channel is dropped before returning, closing both sockets.
    fn exchange<T: ProbeTransport>(
        &self,
        transport: &mut T,
        ttl: u8,
        wait: Duration,
    ) -> Result<(Received, Duration), TraceError> {
        let packet = self.target.build(self.config.protocol, self.identifier, ttl.into());
        let mut channel = transport.open(&self.target, self.config.protocol, ttl)?;
        channel.send(&packet)?;
        let sent_at = Instant::now();
        let received = channel.receive(wait)?;
        let rtt = sent_at.elapsed();
        Ok((received, rtt))
    }

    /// Run to termination, reporting every hop as it completes.
    pub fn run<T, L, O>(
        mut self,
        transport: &mut T,
        lookup: &L,
        observer: &mut O,
    ) -> Result<TraceResult, TraceError>
    where
        T: ProbeTransport,
        L: ReverseLookup + ?Sized,
        O: SessionObserver + ?Sized,
    {
        info!(
            "tracing {} ({}) over {}, {} hops max",
            self.target_name,
            self.target.destination(),
            self.target.family_name(),
            self.config.max_hops
        );
        observer.session_started(&self.info());

        loop {
            let before = self.timeout.current();
            if self.step(transport, lookup)?.is_none() {
                break;
            }
            let Some(hop) = self.hops.last() else {
                break;
            };
            if let Some(e) = &self.last_failure {
                observer.hop_failed(hop.ttl, e);
            }
            observer.hop_completed(hop);
            if self.timeout.current() > before {
                observer.timeout_raised(self.timeout.current());
            }
        }

        let result = self.into_result();
        info!(
            "trace to {} finished after {} hops, reached={}",
            result.target(),
            result.hops().len(),
            result.destination_reached()
        );
        observer.session_finished(&result);
        Ok(result)
    }

    pub fn into_result(self) -> TraceResult {
        TraceResult::new(
            self.target_name,
            self.target.destination(),
            self.config.protocol,
            self.config.max_hops,
            self.started_at,
            self.timeout.current(),
            self.hops,
        )
    }
}

/// Resolve `host`, set up the transport and run a whole session.
///
/// Resolution and permission failures happen before any probe, so they
/// abort with no hops recorded.
pub fn trace<R, L, T, F, O>(
    host: &str,
    family: AddressFamily,
    config: &SessionConfig,
    resolver: &R,
    lookup: &L,
    make_transport: F,
    observer: &mut O,
) -> Result<TraceResult, TraceError>
where
    R: DestinationResolver + ?Sized,
    L: ReverseLookup + ?Sized,
    T: ProbeTransport,
    F: FnOnce(&ProbeTarget) -> Result<T, TraceError>,
    O: SessionObserver + ?Sized,
{
    config.validate()?;
    let destination = resolver.resolve(host, family)?;
    let target = ProbeTarget::new(destination, transport::detect_source_ip(destination));
    let mut transport = make_transport(&target)?;
    ProbeSession::new(host, target, config.clone())?.run(&mut transport, lookup, observer)
}
