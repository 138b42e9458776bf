//! The `arcd` server daemon binary.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use arcd::config::{Config, LogDestination};
use arcd::credentials::CredentialStore;
use arcd::log::Facility;
use arcd::pool;

/// ARC server daemon: authenticated remote command execution.
///
/// Daemonization (detaching from the controlling terminal) is left to the
/// process supervisor; this binary always runs in the foreground, and `-d`
/// only overrides the configured log level.
#[derive(Parser, Debug)]
#[command(name = "arcd", version, about)]
struct Args {
    /// Run with the given log-level bitmask instead of the configured one.
    #[arg(short = 'd', long = "debug-level")]
    loglevel: Option<u32>,

    /// Path to the INI configuration file.
    #[arg(short = 'F', long = "config", default_value = "/etc/arcd.ini")]
    config: PathBuf,

    /// Override the configured listen ports (comma-separated).
    #[arg(short = 'p', long, value_delimiter = ',')]
    port: Vec<u16>,

    /// Override the configured pid file path.
    #[arg(short = 'P', long)]
    pid_file: Option<PathBuf>,

    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(config: &Config, verbose: u8) {
    let default_directive = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    match config.log_destination {
        LogDestination::Stderr => {
            tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
        }
        LogDestination::Syslog => match arcd::log::syslog_writer::connect(&config.service_name) {
            Ok(writer) => {
                tracing_subscriber::fmt()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_env_filter(filter)
                    .init();
            }
            Err(e) => {
                eprintln!("falling back to stderr logging: {e}");
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if std::env::var(pool::WORKER_FDS_ENV).is_ok() {
        let mut config = Config::load(&args.config)?;
        apply_overrides(&mut config, &args);
        init_tracing(&config, args.verbose);
        arcd::log::set_level(config.log_level);
        let store = CredentialStore::from_ini(&arcd::config::Ini::load(&args.config)?)?;
        return Ok(pool::run_worker(config, store).await?);
    }

    let mut config = Config::load(&args.config)?;
    apply_overrides(&mut config, &args);
    init_tracing(&config, args.verbose);
    arcd::log::set_level(config.log_level);

    tracing::info!(
        id = arcd::SERVER_ID,
        service = %config.service_name,
        ports = ?config.ports,
        "starting arcd"
    );

    pool::run_parent(config).await?;
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if !args.port.is_empty() {
        config.ports = args.port.clone();
    }
    if let Some(pid_file) = &args.pid_file {
        config.pid_file = pid_file.display().to_string();
    }
    if let Some(loglevel) = args.loglevel {
        config.log_level = Facility::from_bits_truncate(loglevel);
    }
}
