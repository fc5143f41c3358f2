//! ovaleval - OVAL-based CVE evaluation service for RPM systems
//!
//! Evaluates a system profile (installed packages, enabled module streams,
//! repositories) against vendor OVAL definitions and reports which CVEs are
//! fixable by an available update and which have no fix yet.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod download;
mod error;
mod evaluator;
mod parsers;
mod rpm;
mod server;
mod storage;
mod unpack;

use cli::Commands;

/// OVAL-based CVE evaluation service
#[derive(Parser)]
#[command(name = "ovaleval")]
#[command(version)]
#[command(about = "OVAL-based CVE evaluation service for RPM systems", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_target(false)
        .init();

    cli::execute(cli.command)
}
