use std::process::ExitCode;

use anyhow::Context;
use clap::{error::ErrorKind, Parser};
use hoptrace::{
    chart,
    log_sink::EventLog,
    report::{self, ConsoleReport},
    resolve::{DnsResolver, NumericLookup, ReverseLookup},
    session,
    transport::RawSocketTransport,
    Args, Result,
};
use tokio::runtime::Handle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    // Diagnostics go to stderr so stdout carries only the trace
    let default_filter = if args.verbose { "hoptrace=debug" } else { "hoptrace=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting hoptrace v{}", env!("CARGO_PKG_VERSION"));
    info!("Target: {}", args.target);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = match args.session_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut console = ConsoleReport::stdout(EventLog::open(&args.log_file));
    let handle = Handle::current();
    let target = args.target.clone();
    let family = args.family();
    let numeric = args.numeric;

    // The probe loop blocks on sockets; keep it off the async workers
    let (outcome, mut console) = tokio::task::spawn_blocking(move || {
        let resolver = DnsResolver::new(handle);
        let lookup: Box<dyn ReverseLookup> = if numeric {
            Box::new(NumericLookup)
        } else {
            Box::new(resolver.clone())
        };
        let outcome = session::trace(
            &target,
            family,
            &config,
            &resolver,
            lookup.as_ref(),
            RawSocketTransport::new,
            &mut console,
        );
        (outcome, console)
    })
    .await
    .context("probe session terminated unexpectedly")?;

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            console.session_failed(&e);
            return Ok(ExitCode::FAILURE);
        }
    };

    if !args.no_chart {
        let written = chart::write_rtt_chart(&result, &args.chart_file)
            .with_context(|| format!("failed to write chart {}", args.chart_file.display()));
        match written {
            Ok(outcome) => console.chart_finished(&outcome),
            Err(e) => warn!("{:#}", e),
        }
    }

    if let Some(path) = &args.json {
        if let Err(e) = report::write_json(&result, path) {
            warn!("{:#}", e);
        }
    }

    Ok(ExitCode::SUCCESS)
}
