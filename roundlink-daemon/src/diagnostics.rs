//! Command line and logging
//!
//! Parses the daemon's command line and installs the tracing subscriber.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// RoundLink daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "roundlink-daemon")]
#[command(about = "Connects to nearby devices speaking the KDE Connect protocol", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    pub timestamps: bool,

    /// Configuration file (defaults to $XDG_CONFIG_HOME/roundlink/daemon.toml)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// One-shot commands that do not start the daemon
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Print the local device id and certificate fingerprint
    ShowIdentity,

    /// List paired devices from the store
    ListPaired,
}

/// Initialize logging based on CLI configuration
///
/// `RUST_LOG` takes precedence over `--log-level`.
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["roundlink-daemon"]);
        assert_eq!(cli.log_level, "info");
        assert!(!cli.json_logs);
        assert!(cli.timestamps);
        assert!(cli.config.is_none());
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_flags_and_subcommand() {
        let cli = Cli::parse_from([
            "roundlink-daemon",
            "--log-level",
            "debug",
            "--json-logs",
            "--timestamps",
            "false",
            "--config",
            "/tmp/daemon.toml",
            "show-identity",
        ]);
        assert_eq!(cli.log_level, "debug");
        assert!(cli.json_logs);
        assert!(!cli.timestamps);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/daemon.toml")));
        assert_eq!(cli.command, Some(Command::ShowIdentity));
    }

    #[test]
    fn test_list_paired_subcommand() {
        let cli = Cli::parse_from(["roundlink-daemon", "list-paired"]);
        assert_eq!(cli.command, Some(Command::ListPaired));
    }
}
