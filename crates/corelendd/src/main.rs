//! corelendd — the corelend daemon.
//!
//! Single binary that assembles every corelend subsystem:
//! - Environment probe and limits
//! - Worker supervisor (control channel or file mode)
//! - Load monitor + allocator
//! - Health monitor
//! - Admin/load-ingest API
//!
//! # Usage
//!
//! ```text
//! corelendd run --config /etc/corelend/corelend.toml
//! corelendd detect
//! corelendd plan --units 0 --units 4 --units 12
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use corelend_env::EnvironmentProbe;

#[derive(Parser)]
#[command(name = "corelendd", about = "corelend daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon until interrupted.
    Run {
        /// Config file; created with corrections when validation changes it.
        #[arg(long, default_value = "corelend.toml")]
        config: PathBuf,
    },
    /// Detect the hosting environment and print the derived limits.
    Detect {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the core allocation for the given load unit counts.
    Plan {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Load unit counts to evaluate.
        #[arg(long = "units", required = true)]
        units: Vec<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => daemon::run(config).await,
        Command::Detect { config } => detect(config),
        Command::Plan { config, units } => plan(config, &units),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,corelendd=debug,corelend=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn detect(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = daemon::load_config(config.as_deref())?;
    let report = EnvironmentProbe::system()
        .with_override(config.environment.override_kind)
        .report();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn plan(config: Option<PathBuf>, units: &[u32]) -> anyhow::Result<()> {
    let config = daemon::load_config(config.as_deref())?;
    let report = EnvironmentProbe::system()
        .with_override(config.environment.override_kind)
        .report();
    let validated = config.allocation.validate(&report.limits, report.host_cores);
    for correction in &validated.corrections {
        eprintln!("corrected {correction}");
    }

    println!(
        "environment: {} (max {} cores, recommended {}, {})",
        report.kind,
        report.limits.max_cores,
        report.limits.recommended_cores,
        if report.limits.strict { "strict" } else { "lenient" }
    );
    println!(
        "allocation: total {} reserved {} per-unit {}",
        validated.config.total_cores,
        validated.config.reserved_cores,
        validated.config.cores_per_load_unit
    );
    for &load_units in units {
        let cores = corelend_autoscale::compute(load_units, &validated.config, &report.limits);
        println!("  {load_units:>5} units -> {cores} cores");
    }
    Ok(())
}
