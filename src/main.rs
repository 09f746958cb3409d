//! wallmon - firewall traffic monitor agent.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use wallmon::capture::list_interfaces;
use wallmon::config::DEFAULT_CONFIG_PATH;
use wallmon::{Config, RunSignal, Sniffer};

#[derive(Parser)]
#[command(name = "wallmon")]
#[command(about = "Capture packet headers and push them to a collector")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "WALLMON_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Z85 CURVE public key of the collector (overrides the configuration)
    #[arg(short = 'k', long)]
    collector_key: Option<String>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long)]
    verbose: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    /// List capture interfaces and exit
    #[arg(long)]
    list_interfaces: bool,
}

fn init_logging(config: &Config, verbose: bool) {
    let fallback = if verbose { "debug" } else { config.tracing_filter() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    if cli.list_interfaces {
        for line in list_interfaces().context("failed to list interfaces")? {
            println!("{}", line);
        }
        return Ok(());
    }

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(key) = cli.collector_key {
        config.collector_key = Some(key);
    }

    init_logging(&config, cli.verbose);

    match &config.source {
        Some(path) => tracing::debug!("Loaded configuration from {}", path.display()),
        None => tracing::debug!("{} not found, using environment only", cli.config.display()),
    }
    for key in &config.ignored_keys {
        tracing::warn!("Ignoring unknown configuration key '{}'", key);
    }

    let settings = config.validate().context("invalid configuration")?;

    if cli.check_config {
        println!("config: {}", cli.config.display());
        println!("system_uuid: {}", settings.system_id);
        println!("server_url: {}", settings.server_url);
        println!("monitor_url: {}", settings.monitor_url);
        println!(
            "management interface: {}",
            settings.management_interface.as_deref().unwrap_or("(none)")
        );
        println!("exclude server traffic: {}", settings.filter_server_traffic);
        return Ok(());
    }

    let collector_key = config.collector_key()?;

    tracing::info!("Starting wallmon for system {}", settings.system_id);

    let signal = RunSignal::new();
    let handler_signal = signal.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Termination requested, stopping capture");
        handler_signal.cancel();
    })
    .context("failed to install signal handler")?;

    let mut sniffer = Sniffer::initialize(&collector_key, &settings, signal)
        .context("failed to initialize the sniffer")?;

    let result = sniffer.run();
    sniffer.finalize();
    result.context("capture failed")?;

    tracing::info!("wallmon stopped");
    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
