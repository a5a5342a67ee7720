//! nlmon
//!
//! Main entry point. Parses the command line, sets up logging and runs the
//! monitor until SIGINT/SIGTERM or a fatal error.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - AU-3: Content of Audit Records - Structured logging
//! - AU-12: Audit Record Generation - Log monitor lifecycle
//! - SI-4: System Monitoring - Real-time event processing

use nlmon::{
    Command, MonitorConfig, NlmonError, Result, config::DEFAULT_LOG_FILTER, parse_args,
    print_usage,
};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = match parse_args(std::env::args_os()) {
        Ok(Command::Help) => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Ok(Command::Run(config)) => config,
        Err(e) => {
            eprintln!("nlmon: {e}");
            print_usage();
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = init_logging() {
        eprintln!("nlmon: {e}");
        return ExitCode::from(e.exit_code());
    }

    match run(config).await {
        Ok(()) => {
            info!("Exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, os_error = ?e.os_error(), "Exiting with error");
            eprintln!("nlmon: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initialize structured logging on stderr
///
/// Notification lines go to stderr unfiltered; this only controls the
/// diagnostic log, which defaults to warnings and above.
fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| NlmonError::Config(format!("Failed to set logger: {}", e)))?;

    Ok(())
}

/// Set up the session, monitor and event source, then dispatch until done
///
/// Everything allocated here is released in reverse order when it goes out
/// of scope, including on a partial setup failure.
#[cfg(target_os = "linux")]
async fn run(config: MonitorConfig) -> Result<()> {
    use nlmon::{Monitor, NetlinkSession, SignalEventSource, StderrNotifier};
    use std::rc::Rc;

    let session = NetlinkSession::open()?;
    let mut monitor = Monitor::new(session, &config, Rc::new(StderrNotifier))?;
    let mut events = SignalEventSource::new(monitor.manager().as_raw_fd())?;

    monitor.run(&mut events).await
}

#[cfg(not(target_os = "linux"))]
async fn run(_config: MonitorConfig) -> Result<()> {
    Err(NlmonError::setup(
        nlmon::SetupStage::Socket,
        std::io::Error::new(std::io::ErrorKind::Unsupported, "netlink requires Linux"),
    ))
}
