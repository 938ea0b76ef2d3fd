use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::error::TraceError;
use crate::packet::ProbeIdentifier;
use crate::resolve::AddressFamily;
use crate::session::SessionConfig;

#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    /// ICMP Echo (ping) - default and most common
    Icmp,
    /// UDP datagrams to a high port (answered with Port Unreachable)
    Udp,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "hoptrace")]
#[command(about = "Trace the route to a host hop by hop, with adaptive timeouts and an RTT chart")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Args {
    /// Target hostname or IP address
    pub target: String,

    /// Maximum number of hops
    #[arg(short = 'm', long, default_value = "30")]
    pub max_hops: u8,

    /// Initial time to wait for each reply, in seconds
    #[arg(short, long, default_value = "1.0")]
    pub wait: f64,

    /// Seconds added to the wait after three consecutive timeouts (0 disables)
    #[arg(long, default_value = "1.0")]
    pub timeout_step: f64,

    /// Probe protocol
    #[arg(short = 'P', long, value_enum, default_value = "icmp")]
    pub protocol: ProbeProtocol,

    /// Fixed UDP destination port (default: random in 33434-33534)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Fixed ICMP identifier (default: random)
    #[arg(long)]
    pub ident: Option<u16>,

    /// Resolve and trace over IPv4 only
    #[arg(short = '4', conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Prefer IPv6 when resolving the target
    #[arg(short = '6')]
    pub ipv6: bool,

    /// Show IP addresses instead of hostnames
    #[arg(short, long)]
    pub numeric: bool,

    /// Append a line per event to this file
    #[arg(long, default_value = "traceroute.log")]
    pub log_file: PathBuf,

    /// Where to save the RTT chart
    #[arg(long, default_value = "traceroute_graph.txt")]
    pub chart_file: PathBuf,

    /// Do not render the RTT chart
    #[arg(long)]
    pub no_chart: bool,

    /// Also write the results as JSON to this file
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Record a failing hop as unanswered instead of aborting the trace
    #[arg(long)]
    pub keep_going: bool,

    /// Verbose diagnostics on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn family(&self) -> AddressFamily {
        if self.ipv4 {
            AddressFamily::V4Only
        } else if self.ipv6 {
            AddressFamily::PreferV6
        } else {
            AddressFamily::PreferV4
        }
    }

    /// Validate the numeric options and build the session configuration.
    pub fn session_config(&self) -> Result<SessionConfig, TraceError> {
        let initial_timeout = seconds("--wait", self.wait)?;
        let timeout_step = seconds("--timeout-step", self.timeout_step)?;
        if initial_timeout.is_zero() {
            return Err(TraceError::InvalidConfig("--wait must be positive".into()));
        }

        let identifier = match self.protocol {
            ProbeProtocol::Icmp => self.ident.map(ProbeIdentifier::new),
            ProbeProtocol::Udp => self.port.map(ProbeIdentifier::new),
        };

        let config = SessionConfig {
            protocol: self.protocol,
            max_hops: self.max_hops,
            initial_timeout,
            timeout_step,
            identifier,
            keep_going: self.keep_going,
            ..SessionConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

fn seconds(flag: &str, value: f64) -> Result<Duration, TraceError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| TraceError::InvalidConfig(format!("{flag} must be a non-negative number of seconds")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_values() {
        let args = Args::try_parse_from(["hoptrace", "example.com"]).unwrap();
        assert_eq!(args.target, "example.com");
        assert_eq!(args.max_hops, 30);
        assert_eq!(args.wait, 1.0);
        assert_eq!(args.timeout_step, 1.0);
        assert_eq!(args.protocol, ProbeProtocol::Icmp);
        assert_eq!(args.log_file, PathBuf::from("traceroute.log"));
        assert_eq!(args.chart_file, PathBuf::from("traceroute_graph.txt"));
        assert!(args.port.is_none());
        assert!(!args.numeric);
        assert!(!args.no_chart);
        assert!(!args.keep_going);
        assert_eq!(args.family(), AddressFamily::PreferV4);
    }

    #[test]
    fn test_missing_target_is_rejected() {
        let err = Args::try_parse_from(["hoptrace"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_args_short_flags() {
        let args = Args::try_parse_from([
            "hoptrace", "-m", "15", "-w", "2.5", "-P", "udp", "-p", "33500", "-n", "-6", "host.example",
        ])
        .unwrap();

        assert_eq!(args.target, "host.example");
        assert_eq!(args.max_hops, 15);
        assert_eq!(args.wait, 2.5);
        assert_eq!(args.protocol, ProbeProtocol::Udp);
        assert_eq!(args.port, Some(33500));
        assert!(args.numeric);
        assert_eq!(args.family(), AddressFamily::PreferV6);
    }

    #[test]
    fn test_ipv4_and_ipv6_conflict() {
        assert!(Args::try_parse_from(["hoptrace", "-4", "-6", "example.com"]).is_err());
    }

    #[test]
    fn test_session_config_uses_port_as_udp_identifier() {
        let args = Args::try_parse_from(["hoptrace", "-P", "udp", "-p", "33440", "--ident", "9", "x"]).unwrap();
        let config = args.session_config().unwrap();
        assert_eq!(config.identifier, Some(ProbeIdentifier::new(33440)));
        assert_eq!(config.initial_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_session_config_rejects_bad_values() {
        let args = Args::try_parse_from(["hoptrace", "-w", "0", "x"]).unwrap();
        assert!(matches!(args.session_config(), Err(TraceError::InvalidConfig(_))));

        let args = Args::try_parse_from(["hoptrace", "--timeout-step=-1", "x"]).unwrap();
        assert!(matches!(args.session_config(), Err(TraceError::InvalidConfig(_))));

        let args = Args::try_parse_from(["hoptrace", "-m", "0", "x"]).unwrap();
        assert!(matches!(args.session_config(), Err(TraceError::InvalidConfig(_))));
    }

    #[test]
    fn test_session_config_rejects_huge_durations() {
        let args = Args::try_parse_from(["hoptrace", "-w", "1e19", "x"]).unwrap();
        assert!(matches!(args.session_config(), Err(TraceError::InvalidConfig(_))));

        let args = Args::try_parse_from(["hoptrace", "--timeout-step", "1e19", "x"]).unwrap();
        assert!(matches!(args.session_config(), Err(TraceError::InvalidConfig(_))));

        let args = Args::try_parse_from(["hoptrace", "-w", "3600", "x"]).unwrap();
        assert!(args.session_config().is_ok());
    }
}
