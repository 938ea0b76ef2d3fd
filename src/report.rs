use std::{
    fs::File,
    io::{self, BufWriter, Write},
    net::IpAddr,
    path::Path,
    time::Duration,
};

use anyhow::Context;
use tracing::warn;

use crate::chart::ChartOutcome;
use crate::error::TraceError;
use crate::hop::{HopRecord, TraceResult};
use crate::log_sink::EventLog;
use crate::session::{SessionInfo, SessionObserver};
use crate::utils;
use crate::Result;

fn format_banner(target: &str, destination: IpAddr, max_hops: u8) -> String {
    format!("traceroute to {} ({}), {} hops max", target, destination, max_hops)
}

fn format_hop(hop: &HopRecord) -> String {
    match (hop.responder, hop.rtt_ms) {
        (Some(addr), Some(rtt)) if hop.resolved_name.is_some() => {
            format!("{:2}  {} ({})  {:.2} ms", hop.ttl, hop.display_name(), addr, rtt)
        }
        (Some(_), Some(rtt)) => format!("{:2}  {}  {:.2} ms", hop.ttl, hop.display_name(), rtt),
        _ => format!("{:2}  *  request timed out", hop.ttl),
    }
}

fn format_summary(result: &TraceResult) -> String {
    let answered = result.measured().count();
    let total = result.hops().len();
    match (result.mean_rtt_ms(), result.min_rtt_ms(), result.max_rtt_ms()) {
        (Some(mean), Some(min), Some(max)) => format!(
            "{} of {} hops answered, rtt min/mean/max = {:.2}/{:.2}/{:.2} ms",
            answered, total, min, mean, max
        ),
        _ => format!("{} of {} hops answered", answered, total),
    }
}

fn format_outcome(result: &TraceResult) -> String {
    if result.destination_reached() {
        "destination reached".to_string()
    } else {
        format!("destination not reached within {} hops", result.max_hops())
    }
}

fn format_error(error: &TraceError) -> String {
    match error {
        TraceError::Resolution { host, .. } => format!("error: cannot resolve destination {}", host),
        other => format!("error: {}", other),
    }
}

/// Prints each hop as it completes and mirrors it to the event log.
pub struct ConsoleReport<W: Write> {
    out: W,
    log: EventLog,
}

impl ConsoleReport<io::Stdout> {
    pub fn stdout(log: EventLog) -> Self {
        Self::new(io::stdout(), log)
    }
}

impl<W: Write> ConsoleReport<W> {
    pub fn new(out: W, log: EventLog) -> Self {
        Self { out, log }
    }

    fn emit(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|_| self.out.flush()) {
            warn!("console write failed: {}", e);
        }
        self.log.record(line);
    }

    fn blank_line(&mut self) {
        if let Err(e) = writeln!(self.out) {
            warn!("console write failed: {}", e);
        }
    }

    /// Report an aborted session once, on stderr and in the log.
    pub fn session_failed(&mut self, error: &TraceError) {
        let message = format_error(error);
        eprintln!("{}", message);
        self.log.record(&message);
    }

    pub fn chart_finished(&mut self, outcome: &ChartOutcome) {
        match outcome {
            ChartOutcome::Written(path) => self.emit(&format!("RTT chart saved to {}", path.display())),
            ChartOutcome::Skipped => self.emit("no RTT measurements, chart not generated"),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> SessionObserver for ConsoleReport<W> {
    fn session_started(&mut self, info: &SessionInfo) {
        self.emit(&format_banner(&info.target, info.destination, info.max_hops));
    }

    fn hop_completed(&mut self, hop: &HopRecord) {
        self.emit(&format_hop(hop));
    }

    fn timeout_raised(&mut self, timeout: Duration) {
        self.emit(&format!(
            "    consecutive timeouts, waiting {} per hop",
            utils::time::format_seconds(timeout)
        ));
    }

    fn hop_failed(&mut self, ttl: u8, error: &TraceError) {
        self.emit(&format!("    probe {} failed: {}", ttl, error));
    }

    fn session_finished(&mut self, result: &TraceResult) {
        self.blank_line();
        self.emit(&format_outcome(result));
        self.emit(&format_summary(result));
    }
}

/// Save the whole result as pretty-printed JSON.
pub fn write_json(result: &TraceResult, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create JSON report {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, result).context("failed to serialize trace result")?;
    writer.flush().context("failed to write JSON report")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::ProbeProtocol;
    use crate::packet::{ProbeIdentifier, ProbeKey};
    use crate::reply::{Reply, ReplyKind};
    use chrono::Utc;
    use std::{fs, io};

    fn dst() -> IpAddr {
        "93.184.216.34".parse().unwrap()
    }

    fn reply(addr: &str, kind: ReplyKind) -> Reply {
        Reply {
            responder: addr.parse().unwrap(),
            kind,
            key: ProbeKey::Echo {
                identifier: 1,
                sequence: 1,
            },
        }
    }

    fn result(hops: Vec<HopRecord>) -> TraceResult {
        TraceResult::new(
            "example.com".into(),
            dst(),
            ProbeProtocol::Icmp,
            30,
            Utc::now(),
            Duration::from_secs(1),
            hops,
        )
    }

    #[test]
    fn test_format_hop_lines() {
        let mut named = HopRecord::replied(
            1,
            &reply("192.168.1.1", ReplyKind::TimeExceeded),
            Duration::from_micros(1234),
            dst(),
        );
        named.resolved_name = Some("router.lan".into());
        assert_eq!(format_hop(&named), " 1  router.lan (192.168.1.1)  1.23 ms");

        let bare = HopRecord::replied(
            12,
            &reply("10.1.2.3", ReplyKind::TimeExceeded),
            Duration::from_millis(20),
            dst(),
        );
        assert_eq!(format_hop(&bare), "12  10.1.2.3  20.00 ms");

        assert_eq!(format_hop(&HopRecord::timed_out(3)), " 3  *  request timed out");
    }

    #[test]
    fn test_banner_and_outcome() {
        assert_eq!(
            format_banner("example.com", dst(), 30),
            "traceroute to example.com (93.184.216.34), 30 hops max"
        );
        assert_eq!(format_outcome(&result(vec![HopRecord::timed_out(1)])), "destination not reached within 30 hops");
        let reached = result(vec![HopRecord::replied(
            1,
            &reply("93.184.216.34", ReplyKind::EchoReply),
            Duration::from_millis(4),
            dst(),
        )]);
        assert_eq!(format_outcome(&reached), "destination reached");
        assert_eq!(
            format_summary(&reached),
            "1 of 1 hops answered, rtt min/mean/max = 4.00/4.00/4.00 ms"
        );
    }

    #[test]
    fn test_resolution_error_message() {
        let err = TraceError::Resolution {
            host: "no-such-host.invalid".into(),
            reason: "NXDOMAIN".into(),
        };
        assert_eq!(format_error(&err), "error: cannot resolve destination no-such-host.invalid");
        let denied = TraceError::Permission(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(format_error(&denied).contains("CAP_NET_RAW"));
    }

    #[test]
    fn test_console_report_streams_lines() {
        let mut report = ConsoleReport::new(Vec::new(), EventLog::disabled());
        report.session_started(&SessionInfo {
            target: "example.com".into(),
            destination: dst(),
            source: None,
            protocol: ProbeProtocol::Icmp,
            identifier: ProbeIdentifier::new(7),
            max_hops: 30,
            initial_timeout: Duration::from_secs(1),
        });
        report.hop_completed(&HopRecord::timed_out(1));
        report.timeout_raised(Duration::from_secs(2));
        report.session_finished(&result(vec![HopRecord::timed_out(1)]));
        report.chart_finished(&ChartOutcome::Skipped);

        let output = String::from_utf8(report.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines[0], "traceroute to example.com (93.184.216.34), 30 hops max");
        assert_eq!(lines[1], " 1  *  request timed out");
        assert_eq!(lines[2], "    consecutive timeouts, waiting 2s per hop");
        assert_eq!(lines[4], "destination not reached within 30 hops");
        assert_eq!(lines[5], "0 of 1 hops answered");
        assert_eq!(lines[6], "no RTT measurements, chart not generated");
    }

    #[test]
    fn test_write_json_report() {
        let path = std::env::temp_dir().join(format!("hoptrace-{}-report.json", std::process::id()));
        write_json(&result(vec![HopRecord::timed_out(1)]), &path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["target"], "example.com");
        assert_eq!(value["hops"][0]["ttl"], 1);
        assert_eq!(value["hops"][0]["rtt_ms"], serde_json::Value::Null);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_event_log_gets_no_empty_entries() {
        let path = std::env::temp_dir().join(format!("hoptrace-{}-report.log", std::process::id()));
        let _ = fs::remove_file(&path);
        let mut report = ConsoleReport::new(Vec::new(), EventLog::open(&path));
        report.hop_completed(&HopRecord::timed_out(1));
        report.session_finished(&result(vec![HopRecord::timed_out(1)]));
        let console = String::from_utf8(report.into_inner()).unwrap();

        let logged = fs::read_to_string(&path).unwrap();
        let messages: Vec<&str> = logged
            .lines()
            .map(|line| line.split_once("] ").map_or("", |(_, message)| message))
            .collect();
        assert_eq!(
            messages,
            vec![" 1  *  request timed out", "destination not reached within 30 hops", "0 of 1 hops answered"]
        );
        assert_eq!(console.lines().nth(1), Some(""));
        fs::remove_file(&path).unwrap();
    }
}
