//! Forward and reverse name resolution.
//!
//! The probe loop is synchronous, so the async hickory resolver is driven
//! through a runtime [`Handle`] from the blocking thread the loop runs on.

use std::{net::IpAddr, time::Duration};

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::TraceError;

/// Upper bound on a single DNS query, forward or reverse
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Which address to pick when a name has several.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    PreferV4,
    PreferV6,
    V4Only,
}

impl AddressFamily {
    /// Choose one address from a lookup answer.
    pub fn select<I: IntoIterator<Item = IpAddr>>(self, addrs: I) -> Option<IpAddr> {
        let addrs: Vec<IpAddr> = addrs.into_iter().collect();
        let v4 = addrs.iter().copied().find(IpAddr::is_ipv4);
        let v6 = addrs.iter().copied().find(IpAddr::is_ipv6);
        match self {
            AddressFamily::PreferV4 => v4.or(v6),
            AddressFamily::PreferV6 => v6.or(v4),
            AddressFamily::V4Only => v4,
        }
    }
}

/// Turns the user's destination into one address.
pub trait DestinationResolver {
    fn resolve(&self, host: &str, family: AddressFamily) -> Result<IpAddr, TraceError>;
}

/// Best-effort reverse lookup. Never fails; `None` means "show the address".
pub trait ReverseLookup {
    fn reverse(&self, addr: IpAddr) -> Option<String>;
}

/// Reverse lookup that never queries, for `--numeric`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericLookup;

impl ReverseLookup for NumericLookup {
    fn reverse(&self, _addr: IpAddr) -> Option<String> {
        None
    }
}

/// Parse `host` as a literal address, honouring an IPv4-only request.
fn literal(host: &str, family: AddressFamily) -> Option<Result<IpAddr, TraceError>> {
    let ip = host.parse::<IpAddr>().ok()?;
    if family == AddressFamily::V4Only && ip.is_ipv6() {
        return Some(Err(TraceError::Resolution {
            host: host.to_string(),
            reason: "IPv6 literal given with -4".into(),
        }));
    }
    Some(Ok(ip))
}

/// hickory-backed resolver using the system configuration.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    handle: Handle,
    lookup_timeout: Duration,
}

impl DnsResolver {
    pub fn new(handle: Handle) -> Self {
        let resolver = {
            // The resolver spawns its background tasks on the current runtime
            let _guard = handle.enter();
            TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
                warn!("system resolver configuration unavailable ({}), using defaults", e);
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            })
        };
        Self {
            resolver,
            handle,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }
}

impl DestinationResolver for DnsResolver {
    fn resolve(&self, host: &str, family: AddressFamily) -> Result<IpAddr, TraceError> {
        if let Some(result) = literal(host, family) {
            return result;
        }

        let failed = |reason: String| TraceError::Resolution {
            host: host.to_string(),
            reason,
        };

        let lookup = self.handle.block_on(async {
            tokio::time::timeout(self.lookup_timeout, self.resolver.lookup_ip(host)).await
        });
        let answer = match lookup {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(_) => return Err(failed(format!("no answer within {:?}", self.lookup_timeout))),
        };

        let addr = family
            .select(answer.iter())
            .ok_or_else(|| failed("no address of the requested family".into()))?;
        debug!("resolved {} to {}", host, addr);
        Ok(addr)
    }
}

impl ReverseLookup for DnsResolver {
    fn reverse(&self, addr: IpAddr) -> Option<String> {
        let lookup = self.handle.block_on(async {
            tokio::time::timeout(self.lookup_timeout, self.resolver.reverse_lookup(addr)).await
        });
        match lookup {
            Ok(Ok(names)) => names
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Ok(Err(e)) => {
                debug!("reverse lookup for {} failed: {}", addr, e);
                None
            }
            Err(_) => {
                debug!("reverse lookup for {} timed out", addr);
                None
            }
        }
    }
}
