//! Entitlement command-line host.
//!
//! Prints the entitlement decision for this machine as JSON on stdout. Logs
//! go to stderr.
//!
//! Usage:
//!   entitle status
//!   entitle activate <TOKEN>
//!   entitle hardware-id
//!   entitle --config /etc/acme/entitle.toml status

use anyhow::{Context, Result};
use clap::Parser;
use entitle_cli::{Cli, run};
use entitle_license::{EntitlementConfig, EntitlementContext};
use std::process::ExitCode;
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = match &cli.config {
        Some(path) => EntitlementConfig::load_from(path),
        None => EntitlementConfig::default(),
    };
    debug!("Using storage under {:?}", config.storage_paths().user_dir);

    let mut ctx =
        EntitlementContext::new(config).context("Failed to initialize entitlement context")?;
    let outcome = run(&mut ctx, &cli.command)?;

    println!("{}", serde_json::to_string_pretty(&outcome.json)?);
    Ok(if outcome.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
