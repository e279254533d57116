use pairprobe_core::campaign::CommandCampaign;
use pairprobe_core::config::ProbeConfig;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Brute-force pairing harness for commissioning lockout testing", long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Device executable, replaces the configured device command.
    #[clap(long)]
    device: Option<String>,
    /// Controller executable, replaces the program of the configured controller command.
    #[clap(long)]
    controller: Option<String>,
    #[clap(long)]
    start_passcode: Option<u32>,
    #[clap(short, long)]
    attempts_per_cycle: Option<usize>,
    #[clap(short, long, conflicts_with = "unbounded")]
    max_cycles: Option<u64>,
    /// Keep cycling until interrupted or aborted.
    #[clap(long)]
    unbounded: bool,
    /// Write per-cycle and per-attempt timings as JSON when the campaign ends.
    #[clap(long)]
    timings_out: Option<PathBuf>,
    #[clap(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<ProbeConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            ProbeConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("pairprobe.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                ProbeConfig::load_from_file(&default_config_path)?
            } else {
                info!(
                    "No config file specified and default 'pairprobe.toml' not found, using built-in defaults."
                );
                ProbeConfig::default()
            }
        }
    };

    if let Some(device) = &cli.device {
        config.device.command = vec![device.clone()];
    }
    if let Some(controller) = &cli.controller {
        match config.controller.command.first_mut() {
            Some(program) => *program = controller.clone(),
            None => config.controller.command.push(controller.clone()),
        }
    }
    if let Some(start) = cli.start_passcode {
        config.campaign.start_passcode = start;
    }
    if let Some(attempts) = cli.attempts_per_cycle {
        config.campaign.attempts_per_cycle = attempts;
    }
    if let Some(max_cycles) = cli.max_cycles {
        config.campaign.max_cycles = Some(max_cycles);
    }
    if cli.unbounded {
        config.campaign.max_cycles = None;
    }
    if let Some(path) = &cli.timings_out {
        config.campaign.timings_out = Some(path.clone());
    }

    config.validate()?;
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("could not install Ctrl-C handler, interrupts will kill the harness outright: {e}");
    }

    println!("Starting Commissioning Brute-Force Test...");
    println!("Device: {:?}", config.device.command);
    println!("Controller: {:?}", config.controller.command);
    println!("Attempts per cycle: {}", config.campaign.attempts_per_cycle);
    match config.campaign.max_cycles {
        Some(max) => println!("Max cycles: {max}"),
        None => println!("Max cycles: unbounded"),
    }
    println!("{}", "-".repeat(30));

    let mut campaign = CommandCampaign::from_config(&config, interrupted);
    let report = campaign.run_with(|cycle| println!("\n{cycle}"));

    println!("\n{report}");

    if let Some(path) = &config.campaign.timings_out {
        match report.write_timings(path) {
            Ok(()) => info!("timings written to {}", path.display()),
            Err(e) => error!("failed to write timings: {e:#}"),
        }
    }

    if report.end.is_abort() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
