//! Command definitions and dispatch for the `entitle` binary.

use clap::{Parser, Subcommand};
use entitle_license::{DeviceInfo, EntitlementContext};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "entitle")]
#[command(about = "Trial and license status for this machine")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the current entitlement status
    Status,
    /// Activate a license token
    Activate {
        /// The license token as issued
        token: String,
    },
    /// Print the machine fingerprint licenses are bound to
    HardwareId,
    /// Delete the trial state and all day stamps
    #[cfg(any(debug_assertions, feature = "support-tools"))]
    ResetTrial,
    /// Remove the stored license; consumed licenses stay consumed
    #[cfg(any(debug_assertions, feature = "support-tools"))]
    Deactivate,
}

#[derive(Serialize, Debug, Clone)]
pub struct HardwareIdResponse {
    pub hardware_id: Option<String>,
    pub device: DeviceInfo,
}

/// Output of one command: the JSON to print and whether it succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub json: Value,
    pub success: bool,
}

impl Outcome {
    fn ok(json: Value) -> Self {
        Self {
            json,
            success: true,
        }
    }
}

/// Runs `command` against `ctx`.
pub fn run(ctx: &mut EntitlementContext, command: &Command) -> anyhow::Result<Outcome> {
    match command {
        Command::Status => Ok(Outcome::ok(serde_json::to_value(ctx.get_status())?)),
        Command::Activate { token } => {
            let result = ctx.activate(token);
            Ok(Outcome {
                success: result.success,
                json: serde_json::to_value(&result)?,
            })
        }
        Command::HardwareId => {
            let response = HardwareIdResponse {
                hardware_id: ctx.get_hardware_id(),
                device: ctx.device_info(),
            };
            Ok(Outcome {
                success: response.hardware_id.is_some(),
                json: serde_json::to_value(&response)?,
            })
        }
        #[cfg(any(debug_assertions, feature = "support-tools"))]
        Command::ResetTrial => {
            ctx.reset_trial()?;
            Ok(Outcome::ok(serde_json::json!({ "reset": true })))
        }
        #[cfg(any(debug_assertions, feature = "support-tools"))]
        Command::Deactivate => {
            ctx.deactivate()?;
            Ok(Outcome::ok(serde_json::json!({ "deactivated": true })))
        }
    }
}
