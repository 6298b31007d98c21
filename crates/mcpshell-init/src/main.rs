//! mcpshell-init - container entrypoint for the mcpshell application image.
//!
//! Reconciles the runtime identity with the `UID`/`GID` environment,
//! provisions the workspace and SSH key material, then drops privileges and
//! replaces itself with the given command.

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use mcpshell_core::{
    plan_bootstrap, run_bootstrap, BootstrapConfig, BootstrapReceipt, ExecHandoff,
};

/// Exit codes for the entrypoint.
pub mod exit_codes {
    /// Success exit code (only reachable via `--dry-run`; a real run execs).
    pub const SUCCESS: u8 = 0;
    /// General bootstrap failure.
    pub const GENERIC_ERROR: u8 = 1;
    /// Invalid invocation or environment.
    pub const USAGE_ERROR: u8 = 2;
}

/// mcpshell-init - identity, workspace, and key bootstrap
#[derive(Parser, Debug)]
#[command(name = "mcpshell-init")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit the dry-run receipt as JSON
    #[arg(long)]
    json: bool,

    /// Report what would be done without changing anything, then exit
    #[arg(long)]
    dry_run: bool,

    /// Command to exec after the bootstrap completes
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match BootstrapConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "invalid bootstrap environment");
            std::process::exit(exit_codes::USAGE_ERROR.into());
        },
    };

    if cli.dry_run {
        match plan_bootstrap(&config) {
            Ok(receipt) => {
                print_receipt(&receipt, cli.json);
                std::process::exit(exit_codes::SUCCESS.into());
            },
            Err(err) => {
                tracing::error!(error = %err, "dry run failed");
                std::process::exit(exit_codes::GENERIC_ERROR.into());
            },
        }
    }

    if cli.command.is_empty() {
        eprintln!("mcpshell-init: no command to execute; pass one after the flags");
        std::process::exit(exit_codes::USAGE_ERROR.into());
    }

    match run_bootstrap(&config, &cli.command, &ExecHandoff) {
        Ok(never) => match never {},
        Err(err) => {
            tracing::error!(error = %err, "bootstrap failed");
            std::process::exit(exit_codes::GENERIC_ERROR.into());
        },
    }
}

fn print_receipt(receipt: &BootstrapReceipt, json_output: bool) {
    if json_output {
        if let Ok(json) = serde_json::to_string_pretty(receipt) {
            println!("{json}");
        } else {
            println!("{{\"error\":\"serialization_error\"}}");
        }
    } else {
        println!("bootstrap plan (uid {}, gid {}):", receipt.uid, receipt.gid);
        println!();
        for action in &receipt.actions {
            println!("  {:<10} {}", action.kind, action.description);
        }
        println!();
        let planned = receipt.actions.iter().filter(|a| !a.skipped).count();
        println!(
            "{planned} step(s) to perform, {} already satisfied",
            receipt.actions.len() - planned
        );
    }
}
