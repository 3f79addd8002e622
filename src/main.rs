//! luxdm-slave - per-display session and authentication supervisor
//!
//! Entry point for the slave binary. The parent daemon execs one of
//! these per managed display; standalone invocation works for bring-up
//! and debugging.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use luxdm::config::Config;
use luxdm::relay::{DaemonLink, NotifyQueue, Relay};
use luxdm::slave::display::{Display, DisplayType};
use luxdm::slave::Slave;

/// Command-line arguments for luxdm-slave
#[derive(Parser, Debug)]
#[command(name = "luxdm-slave")]
#[command(version, about = "Display manager slave", long_about = None)]
struct Args {
    /// Display to manage, e.g. ":0"
    #[arg(short, long, env = "LUXDM_DISPLAY", default_value = ":0")]
    display: String,

    /// Display type (local|xdmcp|flexi|flexi-nest)
    #[arg(long, env = "LUXDM_DISPLAY_TYPE", default_value = "local")]
    display_type: String,

    /// Remote hostname for XDMCP displays
    #[arg(long)]
    hostname: Option<String>,

    /// Kernel virtual terminal to use
    #[arg(long)]
    vt: Option<i32>,

    /// Run the chooser instead of the greeter (indirect query)
    #[arg(long)]
    chooser: bool,

    /// This is the first display managed by this daemon instance
    #[arg(long, env = "LUXDM_FIRST_DISPLAY")]
    first_display: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "/etc/luxdm/luxdm.toml")]
    config: PathBuf,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "compact")]
    log_format: String,

    /// Write logs to file (in addition to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let config = Config::load(&args.config).unwrap_or_else(|err| {
        eprintln!("config unusable ({err:#}), continuing with defaults");
        Config::default_config()
    });

    let log_level = match args.verbose {
        0 => None,
        1 => Some("debug".to_string()),
        _ => Some("trace".to_string()),
    };
    let config = config.with_overrides(log_level);

    let _log_guard = match init_logging(&args, &config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("could not initialize logging: {err:#}");
            std::process::exit(luxdm::slave::ExitCode::Abort.as_i32());
        }
    };

    info!("luxdm-slave v{}", env!("CARGO_PKG_VERSION"));
    luxdm::utils::log_startup_diagnostics();

    match run(args, config) {
        Ok(code) => std::process::exit(code.as_i32()),
        Err(err) => {
            eprintln!("{}", luxdm::utils::format_admin_error(&err));
            std::process::exit(luxdm::slave::ExitCode::Abort.as_i32());
        }
    }
}

fn run(args: Args, config: Config) -> Result<luxdm::slave::ExitCode> {
    let kind = match args.display_type.as_str() {
        "local" => DisplayType::Local,
        "xdmcp" => DisplayType::Xdmcp,
        "flexi" => DisplayType::Flexi,
        "flexi-nest" => DisplayType::FlexiNest,
        other => anyhow::bail!("unknown display type '{other}'"),
    };

    let mut display = Display::new(&args.display, kind, args.hostname);
    display.vt = args.vt;
    display.use_chooser = args.chooser;

    let link = DaemonLink::open(&config.daemon.fifo_path);
    let notify_path = config.daemon.notify_dir.join(format!(".notify-{}", display.number));
    let notify = match NotifyQueue::open(&notify_path) {
        Ok(queue) => queue,
        Err(err) => {
            warn!(path = %notify_path.display(), %err, "notify pipe unavailable, running detached");
            NotifyQueue::disconnected()
        }
    };
    let relay = Relay::new(link, notify);

    let slave = Slave::new(config, display, relay, args.first_display)?;
    Ok(slave.start())
}

fn init_logging(
    args: &Args,
    config: &Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = config.logging.level.clone();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("luxdm={level},warn")));

    let file_writer = args
        .log_file
        .as_ref()
        .map(|path| -> Result<_> {
            let file = std::fs::File::create(path)?;
            Ok(tracing_appender::non_blocking(file))
        })
        .transpose()?;

    match (args.log_format.as_str(), file_writer) {
        ("json", Some((writer, guard))) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer).with_ansi(false))
                .init();
            Ok(Some(guard))
        }
        ("json", None) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
            Ok(None)
        }
        (_, Some((writer, guard))) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Ok(Some(guard))
        }
        (_, None) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .init();
            Ok(None)
        }
    }
}
